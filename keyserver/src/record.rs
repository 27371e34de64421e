//! Incremental parser for the colon-record search response format.
//!
//! A keyserver answers a search with one line per record:
//!
//! ```text
//! info:1:2:
//! pub:D03F6F865226FE8B:1:2048:1511355130::
//! uid:Testy%20McTestface%20%3Ctesty@example.org%3E:
//! pub:...
//! ```
//!
//! [`RecordParser`] turns these lines, one at a time, into
//! [`KeyRecord`]s.  A record is complete when the next `pub` line
//! starts or when the stream ends.

use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use percent_encoding::percent_decode;

use sequoia_openpgp as openpgp;
use openpgp::types::PublicKeyAlgorithm;

use crate::Descriptor;

/// Marker appended after every user ID in a record's display text.
pub(crate) const LINE_CONTINUATION: &str = "\n\t";

/// Status flags a keyserver may attach to a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags {
    revoked: bool,
    disabled: bool,
    expired: bool,
}

impl RecordFlags {
    /// Returns whether the key is revoked.
    pub fn revoked(&self) -> bool {
        self.revoked
    }

    /// Returns whether the key is disabled.
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Returns whether the key is expired.
    pub fn expired(&self) -> bool {
        self.expired
    }

    /// Returns whether no flag is set.
    pub fn is_empty(&self) -> bool {
        ! (self.revoked || self.disabled || self.expired)
    }

    /// Folds in a flag character.  Unknown characters are ignored.
    fn set_from_char(&mut self, c: char) {
        match c {
            'r' | 'R' => self.revoked = true,
            'd' | 'D' => self.disabled = true,
            'e' | 'E' => self.expired = true,
            _ => (),
        }
    }
}

/// A key announced by a search response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    descriptor: Descriptor,
    created: Option<SystemTime>,
    expires: Option<SystemTime>,
    algo: i64,
    bits: u32,
    flags: RecordFlags,
    user_ids: Vec<String>,
    display: String,
    lines: usize,
}

impl KeyRecord {
    fn new() -> Self {
        KeyRecord {
            descriptor: Descriptor::None,
            created: None,
            expires: None,
            algo: 0,
            bits: 0,
            flags: Default::default(),
            user_ids: Vec::new(),
            display: String::new(),
            lines: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.descriptor.is_key_identifier()
    }

    /// Returns the descriptor identifying the key.
    ///
    /// This is always one of the key-identifying variants.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Returns the key's creation time, if announced.
    pub fn created(&self) -> Option<SystemTime> {
        self.created
    }

    /// Returns the key's expiration time, if announced.
    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    /// Returns the public key algorithm code as sent (0 if absent).
    ///
    /// The value may be outside the range of OpenPGP algorithm
    /// identifiers.
    pub fn algo(&self) -> i64 {
        self.algo
    }

    /// Returns the public key algorithm, if announced and in range.
    pub fn algorithm(&self) -> Option<PublicKeyAlgorithm> {
        match u8::try_from(self.algo) {
            Ok(0) | Err(_) => None,
            Ok(algo) => Some(algo.into()),
        }
    }

    /// Returns the key size in bits (0 if unknown).
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Returns the key's status flags.
    pub fn flags(&self) -> RecordFlags {
        self.flags
    }

    /// Returns the decoded user IDs, in the order they arrived.
    pub fn user_ids(&self) -> &[String] {
        &self.user_ids
    }

    /// Returns the text shown for the user IDs when listing the
    /// record.
    ///
    /// Every user ID is followed by a line break and a tab, so that
    /// the key summary printed after it is indented.
    pub fn display_text(&self) -> &str {
        &self.display
    }

    /// Returns the number of screen lines this record occupies.
    pub fn lines(&self) -> usize {
        self.lines
    }
}

/// Parses colon records into [`KeyRecord`]s.
///
/// The parser keeps the record under construction between calls to
/// [`RecordParser::feed`].  Each search uses its own parser.
#[derive(Debug)]
pub struct RecordParser {
    work: Option<KeyRecord>,
    max_uid_chars: usize,
    now: Option<SystemTime>,
}

impl RecordParser {
    /// Returns a parser truncating user IDs to fit a screen that is
    /// `screen_columns` wide.
    pub fn new(screen_columns: usize) -> Self {
        RecordParser {
            work: None,
            max_uid_chars: screen_columns.saturating_sub(10),
            now: None,
        }
    }

    /// Uses `now` instead of the system clock when deciding whether a
    /// key has expired.
    pub fn at(mut self, now: SystemTime) -> Self {
        self.now = Some(now);
        self
    }

    /// Processes a line, or the end of the stream if `line` is `None`.
    ///
    /// Returns a record if one was completed.  After the end of the
    /// stream, all further flushes return `None`.
    pub fn feed(&mut self, line: Option<&str>) -> Option<KeyRecord> {
        let line = match line {
            Some(line) => line,
            None => return self.flush(),
        };

        let line = line.trim_end();
        let mut fields = line.split(':');
        let tag = fields.next().unwrap_or("");

        if tag.eq_ignore_ascii_case("pub") {
            let done = match self.work.take() {
                Some(work) if work.is_live() => Some(work),
                _ => None,
            };
            let mut work = KeyRecord::new();
            self.parse_pub(&mut work, fields);
            self.work = Some(work);
            done
        } else if tag.eq_ignore_ascii_case("uid") {
            let max = self.max_uid_chars;
            if let Some(work) = self.work.as_mut().filter(|w| w.is_live()) {
                parse_uid(work, fields, max);
            }
            None
        } else {
            // Other record types are ignored for future growth.
            debug!("ignoring {:?} record", tag);
            None
        }
    }

    /// Returns the record under construction, if it is valid.
    pub fn flush(&mut self) -> Option<KeyRecord> {
        self.work.take().filter(KeyRecord::is_live)
    }

    fn parse_pub<'a, I>(&self, work: &mut KeyRecord, mut fields: I)
        where I: Iterator<Item = &'a str>
    {
        let token = match fields.next() {
            Some(t) => t,
            None => return,
        };

        match token.parse::<Descriptor>() {
            Ok(d) if d.is_key_identifier() => work.descriptor = d,
            Ok(d) => {
                debug!("pub record names {}, not a key", d);
                return;
            },
            Err(e) => {
                debug!("ignoring pub record: {}", e);
                return;
            },
        }

        // All fields after the key are optional.
        work.lines += 1;

        let algo = match fields.next() {
            Some(f) => f,
            None => return,
        };
        work.algo = leading_integer(algo);

        let bits = match fields.next() {
            Some(f) => f,
            None => return,
        };
        work.bits = u32::try_from(leading_integer(bits)).unwrap_or(0);

        let created = match fields.next() {
            Some(f) => f,
            None => return,
        };
        work.created = timestamp(leading_integer(created));

        let expires = match fields.next() {
            Some(f) => f,
            None => return,
        };
        work.expires = timestamp(leading_integer(expires));
        if let Some(expires) = work.expires {
            if expires <= self.now.unwrap_or_else(SystemTime::now) {
                work.flags.expired = true;
            }
        }

        if let Some(flags) = fields.next() {
            flags.chars().for_each(|c| work.flags.set_from_char(c));
        }
    }
}

fn parse_uid<'a, I>(work: &mut KeyRecord, mut fields: I, max_chars: usize)
    where I: Iterator<Item = &'a str>
{
    let encoded = match fields.next() {
        Some(f) if ! f.is_empty() => f,
        _ => return,
    };

    let decoded = percent_decode(&mask_bad_escapes(encoded))
        .collect::<Vec<u8>>();
    let userid = displayable(&String::from_utf8_lossy(&decoded), max_chars);

    work.display.push_str(&userid);
    work.display.push_str(LINE_CONTINUATION);
    work.user_ids.push(userid);
    work.lines += 1;
}

/// Replaces `%` escapes that are not followed by two hex digits with
/// `?`.
///
/// Such an escape still consumes the two bytes after the `%`.  A `%`
/// followed by fewer than two bytes is kept.
fn mask_bad_escapes(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes.get(i..i + 3) {
            Some([b'%', hi, lo]) => {
                if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() {
                    out.extend_from_slice(&bytes[i..i + 3]);
                } else {
                    out.push(b'?');
                }
                i += 3;
            },
            _ => {
                out.push(bytes[i]);
                i += 1;
            },
        }
    }
    out
}

/// Escapes control characters and truncates to `max_chars`
/// characters.
fn displayable(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_control() {
            out.push_str(&format!("\\x{:02x}", c as u32));
        } else {
            out.push(c);
        }
    }

    match out.char_indices().nth(max_chars) {
        Some((i, _)) => {
            out.truncate(i);
            out
        },
        None => out,
    }
}

/// Parses the leading decimal integer of `s`, like C's `atoi`.
///
/// Returns 0 if `s` does not start with a number.
pub(crate) fn leading_integer(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let mut value: i64 = 0;
    for d in digits.chars().map_while(|c| c.to_digit(10)) {
        value = value.saturating_mul(10).saturating_add(d as i64);
    }

    if negative { -value } else { value }
}

/// Converts seconds since the epoch, treating non-positive values as
/// absent.
fn timestamp(seconds: i64) -> Option<SystemTime> {
    if seconds <= 0 {
        None
    } else {
        UNIX_EPOCH.checked_add(Duration::from_secs(seconds as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RecordParser {
        RecordParser::new(80).at(UNIX_EPOCH + Duration::from_secs(1_500_000_000))
    }

    #[test]
    fn single_record() {
        let mut p = parser();
        assert!(p.feed(Some("pub:1234567812345678:1:2048:1000000000:0:"))
                .is_none());
        assert!(p.feed(Some("uid:%41%42:")).is_none());
        let r = p.feed(None).expect("a record");

        assert_eq!(r.descriptor(), &Descriptor::LongKeyID(0x1234567812345678));
        assert_eq!(r.algo(), 1);
        assert_eq!(r.algorithm(), Some(PublicKeyAlgorithm::RSAEncryptSign));
        assert_eq!(r.bits(), 2048);
        assert_eq!(r.created(),
                   Some(UNIX_EPOCH + Duration::from_secs(1000000000)));
        assert_eq!(r.expires(), None);
        assert!(r.flags().is_empty());
        assert_eq!(r.user_ids(), &["AB".to_string()]);
        assert_eq!(r.display_text(), "AB\n\t");
        assert_eq!(r.lines(), 2);

        assert!(p.feed(None).is_none());
        assert!(p.flush().is_none());
    }

    #[test]
    fn next_pub_completes_record() {
        let mut p = parser();
        assert!(p.feed(Some("pub:0x11111111:")).is_none());
        let r = p.feed(Some("PUB:0x22222222:")).expect("first record");
        assert_eq!(r.descriptor(), &Descriptor::ShortKeyID(0x11111111));
        assert_eq!(r.lines(), 1);
        let r = p.flush().expect("second record");
        assert_eq!(r.descriptor(), &Descriptor::ShortKeyID(0x22222222));
    }

    #[test]
    fn unclassifiable_key_is_dead() {
        let mut p = parser();
        assert!(p.feed(Some("pub:not-a-key:")).is_none());
        assert!(p.feed(Some("uid:Mallory:")).is_none());
        assert!(p.feed(None).is_none());
    }

    #[test]
    fn dead_record_is_not_emitted_by_next_pub() {
        let mut p = parser();
        assert!(p.feed(Some("pub:=someone:")).is_none());
        assert!(p.feed(Some("uid:someone:")).is_none());
        assert!(p.feed(Some("pub:DEADBEEF:")).is_none());
        let r = p.feed(None).unwrap();
        assert_eq!(r.descriptor(), &Descriptor::ShortKeyID(0xDEADBEEF));
        assert!(r.user_ids().is_empty());
    }

    #[test]
    fn uid_before_pub_is_ignored() {
        let mut p = parser();
        assert!(p.feed(Some("uid:Nobody:")).is_none());
        assert!(p.feed(None).is_none());
    }

    #[test]
    fn flags_and_expiration() {
        let mut p = parser();
        p.feed(Some("pub:DEADBEEF:17:1024:-5:1400000000:rDx:"));
        let r = p.flush().unwrap();
        assert_eq!(r.created(), None);
        assert!(r.flags().revoked());
        assert!(r.flags().disabled());
        // Expired because 1400000000 lies before the parser's clock.
        assert!(r.flags().expired());

        p.feed(Some("pub:DEADBEEF:17:1024:1:1600000000:"));
        let r = p.flush().unwrap();
        assert!(r.expires().is_some());
        assert!(r.flags().is_empty());

        p.feed(Some("pub:DEADBEEF::::0:E"));
        let r = p.flush().unwrap();
        assert!(r.flags().expired());
        assert_eq!(r.expires(), None);
    }

    #[test]
    fn missing_fields_keep_earlier_ones() {
        let mut p = parser();
        p.feed(Some("pub:DEADBEEF:22:256"));
        let r = p.flush().unwrap();
        assert_eq!(r.algo(), 22);
        assert_eq!(r.bits(), 256);
        assert_eq!(r.created(), None);
    }

    #[test]
    fn unknown_records_are_ignored() {
        let mut p = parser();
        p.feed(Some("pub:DEADBEEF:"));
        assert!(p.feed(Some("sig:whatever:")).is_none());
        assert!(p.feed(Some("")).is_none());
        assert!(p.feed(Some("uat:1:2:3")).is_none());
        assert!(p.flush().is_some());
    }

    #[test]
    fn uid_truncation_and_escaping() {
        let mut p = RecordParser::new(15);
        p.feed(Some("pub:DEADBEEF:"));
        p.feed(Some("uid:%41%0a%42CDEFGHIJ:"));
        p.feed(Some("uid::"));
        let r = p.flush().unwrap();
        assert_eq!(r.user_ids(), &["A\\x0a".to_string()]);
        assert_eq!(r.lines(), 2);
    }

    #[test]
    fn bad_escapes() {
        let mut p = parser();
        p.feed(Some("pub:DEADBEEF:"));
        p.feed(Some("uid:a%zzb%4%41c%:"));
        p.feed(Some("uid:100%:"));
        let r = p.flush().unwrap();
        assert_eq!(r.user_ids(), &["a?b?41c%".to_string(), "100%".to_string()]);
    }

    #[test]
    fn out_of_range_numbers() {
        let mut p = parser();
        p.feed(Some("pub:DEADBEEF:273:99999999999:"));
        let r = p.flush().unwrap();
        assert_eq!(r.algo(), 273);
        assert_eq!(r.algorithm(), None);
        assert_eq!(r.bits(), 0);
    }

    #[test]
    fn utf8_user_ids() {
        let mut p = parser();
        p.feed(Some("pub:DEADBEEF:"));
        p.feed(Some("uid:J%C3%BCrgen:"));
        let r = p.flush().unwrap();
        assert_eq!(r.user_ids(), &["Jürgen".to_string()]);
    }

    #[test]
    fn atoi() {
        assert_eq!(leading_integer("2048"), 2048);
        assert_eq!(leading_integer(" 12abc"), 12);
        assert_eq!(leading_integer("-7"), -7);
        assert_eq!(leading_integer("abc"), 0);
        assert_eq!(leading_integer(""), 0);
    }
}
