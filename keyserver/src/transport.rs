//! The interface to the process talking to keyservers.
//!
//! This crate does not do any network I/O.  A [`Transport`] issues
//! the requests and hands back raw response lines and key material.

use std::fmt;
use std::io::{self, Read};

use crate::{KeyserverOptions, KeyserverSpec, Result};

/// A line of a search response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchLine {
    /// A colon record.
    Data(String),
    /// Describes where the response came from.
    Source(String),
}

/// The response to a search request.
///
/// Iterating yields the response lines in order; the end of the
/// iteration is the end of the stream.  Dropping the stream closes
/// it.
pub struct SearchStream {
    lines: Box<dyn Iterator<Item = Result<SearchLine>>>,
}

impl SearchStream {
    /// Wraps an iterator over response lines.
    pub fn new<I>(lines: I) -> Self
        where I: IntoIterator<Item = Result<SearchLine>>,
              I::IntoIter: 'static,
    {
        SearchStream { lines: Box::new(lines.into_iter()) }
    }

    /// Returns a stream over the given colon records.
    pub fn from_lines<I, S>(lines: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>,
    {
        let lines: Vec<Result<SearchLine>> = lines.into_iter()
            .map(|l| Ok(SearchLine::Data(l.into())))
            .collect();
        Self::new(lines)
    }
}

impl Iterator for SearchStream {
    type Item = Result<SearchLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next()
    }
}

impl fmt::Debug for SearchStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SearchStream").finish()
    }
}

/// A retrieval request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    /// Encoded search patterns, see [`crate::planner::encode`].
    pub patterns: Vec<String>,
    /// Use this server instead of the configured ones.
    pub keyserver: Option<KeyserverSpec>,
    /// Hint that the caller prefers a fast answer.
    pub quick: bool,
}

/// Key material returned by the transport.
pub struct KeyData {
    reader: Box<dyn Read>,
    source: Option<String>,
}

impl KeyData {
    /// Wraps a reader.
    pub fn new<R: Read + 'static>(reader: R) -> Self {
        KeyData { reader: Box::new(reader), source: None }
    }

    /// Wraps a buffer.
    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Self::new(io::Cursor::new(bytes.into()))
    }

    /// Records where the data came from.
    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns where the data came from, if known.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Reads all of the key material.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for KeyData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyData")
            .field("source", &self.source)
            .finish()
    }
}

/// Talks to keyservers on our behalf.
pub trait Transport {
    /// Searches the configured keyservers for `query`.
    fn search(&mut self, query: &str, options: &KeyserverOptions)
              -> Result<SearchStream>;

    /// Retrieves the keys matching the request's patterns.
    fn get(&mut self, request: &GetRequest) -> Result<KeyData>;

    /// Uploads key material to the configured keyservers.
    fn put(&mut self, data: &[u8]) -> Result<()>;

    /// Retrieves key material from a URI.
    fn fetch(&mut self, uri: &str) -> Result<KeyData>;

    /// Lists the configured keyservers.
    ///
    /// Returns an error if no keyserver is configured.
    fn keyservers(&mut self) -> Result<Vec<String>>;
}
