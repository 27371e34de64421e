//! Screens key material returned by a keyserver.
//!
//! A keyserver is not trusted to return what we asked for.  Before a
//! key block reaches the importer, [`accept`] checks that it does not
//! carry secret key material and that one of its keys actually
//! matches one of the requested descriptors.

use sequoia_openpgp as openpgp;
use openpgp::{Fingerprint, KeyID, Packet};

use crate::Descriptor;

/// The parts of a key block the screener looks at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Candidate {
    secret: bool,
    keys: Vec<(Fingerprint, KeyID)>,
}

impl Candidate {
    /// Collects the primary key and subkeys of a key block.
    pub fn from_packets<'a, I>(packets: I) -> Self
        where I: IntoIterator<Item = &'a Packet>
    {
        let mut candidate = Candidate::default();
        for p in packets {
            match p {
                Packet::SecretKey(_) => candidate.secret = true,
                Packet::PublicKey(k) =>
                    candidate.keys.push((k.fingerprint(), k.keyid())),
                Packet::PublicSubkey(k) =>
                    candidate.keys.push((k.fingerprint(), k.keyid())),
                _ => (),
            }
        }
        candidate
    }

    #[cfg(test)]
    pub(crate) fn new(secret: bool, keys: Vec<(Fingerprint, KeyID)>) -> Self {
        Candidate { secret, keys }
    }

    /// Returns whether the block contains a secret primary key.
    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Returns the fingerprints and key IDs of the public keys.
    pub fn keys(&self) -> &[(Fingerprint, KeyID)] {
        &self.keys
    }
}

/// Decides whether `candidate` may be imported.
///
/// Secret keys are always refused.  An empty `requested` list
/// accepts any public key block.  Otherwise at least one key must
/// match one of the descriptors; descriptors that cannot be checked
/// against key material, like exact name searches, accept anything.
pub fn accept(requested: &[Descriptor], candidate: &Candidate) -> bool {
    if candidate.secret {
        return false;
    }

    if requested.is_empty() {
        return true;
    }

    candidate.keys.iter().any(|(fpr, keyid)| {
        requested.iter().any(|d| d.matches(fpr, keyid).unwrap_or(true))
    })
}
