//! Key search descriptors.
//!
//! A [`Descriptor`] is a typed criterion naming the key (or keys) a
//! caller wants from a keyserver.  Descriptors are produced by
//! classifying user supplied tokens (see the [`FromStr`]
//! implementation), or directly from [`Fingerprint`]s and [`KeyID`]s
//! of local certificates.
//!
//! [`FromStr`]: std::str::FromStr

use std::fmt;
use std::str::FromStr;

use sequoia_openpgp as openpgp;
use openpgp::{Fingerprint, KeyID};
use openpgp::fmt::hex;

use crate::Error;

#[cfg(test)]
use quickcheck::{Arbitrary, Gen};

/// A key search criterion.
///
/// Only the four key-identifying variants ([`ShortKeyID`],
/// [`LongKeyID`], [`Fingerprint16`] and [`Fingerprint20`]) can be
/// verified against returned key material.  [`First`] and [`Next`]
/// are used when enumerating a local keyring and must never reach
/// the request planner.
///
///   [`ShortKeyID`]: Descriptor::ShortKeyID
///   [`LongKeyID`]: Descriptor::LongKeyID
///   [`Fingerprint16`]: Descriptor::Fingerprint16
///   [`Fingerprint20`]: Descriptor::Fingerprint20
///   [`First`]: Descriptor::First
///   [`Next`]: Descriptor::Next
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// The low 32 bits of a key ID.
    ShortKeyID(u32),
    /// A full 64 bit key ID.
    LongKeyID(u64),
    /// A 16 byte (version 3) fingerprint.
    Fingerprint16([u8; 16]),
    /// A 20 byte (version 4) fingerprint.
    Fingerprint20([u8; 20]),
    /// An exact user ID.
    ExactName(String),
    /// The first key of a keyring.
    First,
    /// The next key of a keyring.
    Next,
    /// Matches nothing; skipped by the planner.
    None,
}

impl Descriptor {
    /// Returns whether this descriptor identifies a key by key ID or
    /// fingerprint.
    pub fn is_key_identifier(&self) -> bool {
        matches!(self,
                 Descriptor::ShortKeyID(_)
                 | Descriptor::LongKeyID(_)
                 | Descriptor::Fingerprint16(_)
                 | Descriptor::Fingerprint20(_))
    }

    /// Returns the key ID named by this descriptor, if any.
    ///
    /// For 20 byte fingerprints this is the key ID derived from the
    /// fingerprint.  Short key IDs and 16 byte fingerprints do not
    /// carry enough information and return `None`.
    pub fn keyid(&self) -> Option<KeyID> {
        match self {
            Descriptor::LongKeyID(id) => Some(KeyID::new(*id)),
            Descriptor::Fingerprint20(fpr) =>
                Some(KeyID::from(Fingerprint::from_bytes(&fpr[..]))),
            _ => None,
        }
    }

    /// Checks a key's fingerprint and key ID against this descriptor.
    ///
    /// Returns `None` if the descriptor cannot be evaluated against
    /// key material (names, keyring enumeration markers).
    pub fn matches(&self, fingerprint: &Fingerprint, keyid: &KeyID)
                   -> Option<bool> {
        match self {
            Descriptor::Fingerprint20(fpr) =>
                Some(fingerprint.as_bytes() == &fpr[..]),
            Descriptor::Fingerprint16(fpr) =>
                Some(fingerprint.as_bytes() == &fpr[..]),
            Descriptor::LongKeyID(id) =>
                Some(keyid_to_u64(keyid) == Some(*id)),
            Descriptor::ShortKeyID(id) =>
                Some(keyid_to_u64(keyid).map(|k| k as u32) == Some(*id)),
            _ => None,
        }
    }
}

/// Returns the numeric value of a v4 key ID.
pub(crate) fn keyid_to_u64(keyid: &KeyID) -> Option<u64> {
    let bytes = keyid.as_bytes();
    if bytes.len() == 8 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Some(u64::from_be_bytes(raw))
    } else {
        None
    }
}

impl From<&Fingerprint> for Descriptor {
    fn from(fpr: &Fingerprint) -> Self {
        let bytes = fpr.as_bytes();
        match bytes.len() {
            20 => {
                let mut raw = [0u8; 20];
                raw.copy_from_slice(bytes);
                Descriptor::Fingerprint20(raw)
            },
            16 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(bytes);
                Descriptor::Fingerprint16(raw)
            },
            _ => Descriptor::from(&KeyID::from(fpr)),
        }
    }
}

impl From<&KeyID> for Descriptor {
    fn from(keyid: &KeyID) -> Self {
        match keyid_to_u64(keyid) {
            Some(id) => Descriptor::LongKeyID(id),
            None => Descriptor::None,
        }
    }
}

impl FromStr for Descriptor {
    type Err = Error;

    /// Classifies a user supplied token.
    ///
    /// Recognizes `=name` for exact user ID lookups and hexadecimal
    /// key IDs and fingerprints, optionally prefixed by `0x`.
    /// Without the prefix, a single leading `0` is tolerated (some
    /// tools print key IDs with one digit of padding).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || Error::InvalidDescriptor(s.into());
        let token = s.trim_start();

        if let Some(name) = token.strip_prefix('=') {
            if name.is_empty() {
                return Err(invalid());
            }
            return Ok(Descriptor::ExactName(name.into()));
        }

        let (digits, prefixed) =
            match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"))
        {
            Some(rest) => (rest, true),
            None => (token, false),
        };

        let hexlen = digits.bytes().take_while(u8::is_ascii_hexdigit).count();
        let tail = &digits[hexlen..];
        if hexlen == 0
            || ! (tail.is_empty() || tail.starts_with(char::is_whitespace))
        {
            return Err(invalid());
        }

        let mut hexdigits = &digits[..hexlen];
        if ! prefixed && hexlen % 2 == 1 && hexdigits.starts_with('0') {
            hexdigits = &hexdigits[1..];
        }

        match hexdigits.len() {
            8 => u32::from_str_radix(hexdigits, 16)
                .map(Descriptor::ShortKeyID)
                .map_err(|_| invalid()),
            16 => u64::from_str_radix(hexdigits, 16)
                .map(Descriptor::LongKeyID)
                .map_err(|_| invalid()),
            32 => {
                let bytes = hex::decode(hexdigits).map_err(|_| invalid())?;
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&bytes);
                Ok(Descriptor::Fingerprint16(raw))
            },
            40 => {
                let bytes = hex::decode(hexdigits).map_err(|_| invalid())?;
                let mut raw = [0u8; 20];
                raw.copy_from_slice(&bytes);
                Ok(Descriptor::Fingerprint20(raw))
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Descriptor::ShortKeyID(id) => write!(f, "0x{:08X}", id),
            Descriptor::LongKeyID(id) => write!(f, "0x{:016X}", id),
            Descriptor::Fingerprint16(fpr) =>
                write!(f, "0x{}", hex::encode(&fpr[..])),
            Descriptor::Fingerprint20(fpr) =>
                write!(f, "0x{}", hex::encode(&fpr[..])),
            Descriptor::ExactName(name) => write!(f, "={}", name),
            Descriptor::First => f.write_str("<first>"),
            Descriptor::Next => f.write_str("<next>"),
            Descriptor::None => f.write_str("<none>"),
        }
    }
}

#[cfg(test)]
impl Arbitrary for Descriptor {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 6 {
            0 => Descriptor::ShortKeyID(u32::arbitrary(g)),
            1 => Descriptor::LongKeyID(u64::arbitrary(g)),
            2 => {
                let mut fpr = [0u8; 16];
                fpr.iter_mut().for_each(|b| *b = u8::arbitrary(g));
                Descriptor::Fingerprint16(fpr)
            },
            3 => {
                let mut fpr = [0u8; 20];
                fpr.iter_mut().for_each(|b| *b = u8::arbitrary(g));
                Descriptor::Fingerprint20(fpr)
            },
            4 => {
                // Occasionally produce names longer than a whole
                // request line.
                let len = if bool::arbitrary(g) {
                    usize::arbitrary(g) % 64 + 1
                } else {
                    usize::arbitrary(g) % 1200 + 1
                };
                Descriptor::ExactName("x".repeat(len))
            },
            _ => Descriptor::None,
        }
    }
}
