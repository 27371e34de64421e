//! Splits descriptor lists into bounded retrieval requests.
//!
//! The transport accepts a limited number of patterns per request:
//! everything has to fit on a single protocol line.  The
//! [`BatchPlanner`] encodes descriptors as search patterns and cuts
//! the list into [`Batch`]es whose estimated line length stays below
//! [`MAX_REQUEST_LINE`].

use crate::Descriptor;
use sequoia_openpgp::fmt::hex;

/// Estimated upper bound for the length of a single request line.
///
/// Somewhat lower than the real limit of the transport.
pub const MAX_REQUEST_LINE: usize = 950;

/// Length reserved for the request framing ("KS_GET --quick --").
pub const REQUEST_OVERHEAD: usize = 17;

/// An encoded search pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern<'a> {
    descriptor: &'a Descriptor,
    text: String,
}

impl<'a> Pattern<'a> {
    /// Returns the descriptor this pattern was built from.
    pub fn descriptor(&self) -> &'a Descriptor {
        self.descriptor
    }

    /// Returns the pattern as sent to the transport.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns whether the retrieval of this pattern should be
    /// announced.
    ///
    /// Exact name lookups are not announced per key.
    pub fn is_quiet(&self) -> bool {
        matches!(self.descriptor, Descriptor::ExactName(_))
    }

    /// Returns the length this pattern adds to the request line.
    pub fn cost(&self) -> usize {
        self.text.len()
    }
}

/// One request's worth of patterns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch<'a> {
    patterns: Vec<Pattern<'a>>,
    consumed: usize,
}

impl<'a> Batch<'a> {
    /// Returns the patterns of this batch.
    pub fn patterns(&self) -> &[Pattern<'a>] {
        &self.patterns
    }

    /// Returns the number of input descriptors this batch accounts
    /// for.
    ///
    /// This includes skipped descriptors, and is never zero for a
    /// batch returned by the planner.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Returns whether the batch has no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the estimated length of the request line.
    pub fn line_length(&self) -> usize {
        REQUEST_OVERHEAD + self.patterns.iter().map(Pattern::cost).sum::<usize>()
    }

    /// Returns the pattern strings.
    pub fn to_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.text.clone()).collect()
    }
}

/// Encodes a descriptor as a search pattern.
///
/// Returns `None` for [`Descriptor::None`].
///
/// # Panics
///
/// Panics on [`Descriptor::First`] and [`Descriptor::Next`], which
/// only make sense for a local keyring and must be resolved before
/// talking to a keyserver.
pub fn encode(descriptor: &Descriptor) -> Option<String> {
    match descriptor {
        Descriptor::Fingerprint20(fpr) =>
            Some(format!("0x{}", hex::encode(&fpr[..]))),
        Descriptor::Fingerprint16(fpr) =>
            Some(format!("0x{}", hex::encode(&fpr[..]))),
        Descriptor::LongKeyID(id) => Some(format!("0x{:016X}", id)),
        Descriptor::ShortKeyID(id) => Some(format!("0x{:08X}", id)),
        // The '=' forces the transport to treat this as an exact
        // search.
        Descriptor::ExactName(name) => Some(format!("={}", name)),
        Descriptor::None => None,
        Descriptor::First | Descriptor::Next =>
            panic!("keyring enumeration descriptor {} cannot be sent \
                    to a keyserver", descriptor),
    }
}

/// Plans the next batch for `descriptors`.
///
/// A descriptor that would push the line length over
/// [`MAX_REQUEST_LINE`] starts the next batch, unless the batch is
/// still empty: an oversized descriptor is accepted alone so that
/// every call makes progress.
pub fn plan(descriptors: &[Descriptor]) -> Batch {
    let mut linelen = REQUEST_OVERHEAD;
    let mut patterns = Vec::new();
    let mut consumed = 0;

    for descriptor in descriptors {
        let text = match encode(descriptor) {
            Some(text) => text,
            None => {
                consumed += 1;
                continue;
            },
        };

        if ! patterns.is_empty() && linelen + text.len() > MAX_REQUEST_LINE {
            break;
        }

        linelen += text.len();
        patterns.push(Pattern { descriptor, text });
        consumed += 1;
    }

    Batch { patterns, consumed }
}

/// Lazily plans batches over a descriptor list.
#[derive(Clone, Debug)]
pub struct BatchPlanner<'a> {
    descriptors: &'a [Descriptor],
    cursor: usize,
}

impl<'a> BatchPlanner<'a> {
    /// Returns a planner for `descriptors`.
    pub fn new(descriptors: &'a [Descriptor]) -> Self {
        BatchPlanner { descriptors, cursor: 0 }
    }

    /// Returns the number of descriptors consumed so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Returns the descriptors not yet consumed.
    pub fn remaining(&self) -> &'a [Descriptor] {
        &self.descriptors[self.cursor..]
    }
}

impl<'a> Iterator for BatchPlanner<'a> {
    type Item = Batch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.remaining();
        if rest.is_empty() {
            return None;
        }

        let batch = plan(rest);
        self.cursor += batch.consumed;
        Some(batch)
    }
}
