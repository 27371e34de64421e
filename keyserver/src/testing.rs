//! Collaborators for unit tests.

use std::collections::VecDeque;
use std::io;

use sequoia_openpgp as openpgp;
use openpgp::{Fingerprint, Packet, PacketPile};

use crate::{KeyserverOptions, Result};
use crate::driver::{ImportOptions, ImportStatus, Importer};
use crate::terminal::Terminal;
use crate::transport::{GetRequest, KeyData, SearchStream, Transport};

/// Testy McTestface's certificate.
pub const TEST_KEY: &str = include_str!("../tests/data/testy.asc");

/// The fingerprint of [`TEST_KEY`].
pub const TEST_FPR: &str = "3E8877C877274692975189F5D03F6F865226FE8B";

/// Answers from canned data and records the requests.
#[derive(Debug, Default)]
pub struct FakeTransport {
    /// Response to every search.
    pub search_lines: Vec<String>,
    /// Search queries seen.
    pub searches: Vec<String>,
    /// Response to the n-th get request.
    pub keys: Vec<Vec<u8>>,
    /// Get requests seen.
    pub requests: Vec<GetRequest>,
    /// Fail the n-th and all later get requests.
    pub fail_after: Option<usize>,
    /// Uploaded key material.
    pub uploads: Vec<Vec<u8>>,
    /// URIs fetched.
    pub fetched: Vec<String>,
    /// Configured keyservers.
    pub keyservers: Vec<String>,
}

impl Transport for FakeTransport {
    fn search(&mut self, query: &str, _: &KeyserverOptions)
              -> Result<SearchStream> {
        self.searches.push(query.into());
        Ok(SearchStream::from_lines(self.search_lines.clone()))
    }

    fn get(&mut self, request: &GetRequest) -> Result<KeyData> {
        self.requests.push(request.clone());
        let n = self.requests.len() - 1;
        if self.fail_after.map(|f| n >= f).unwrap_or(false) {
            return Err(anyhow::anyhow!("keyserver unreachable"));
        }
        Ok(KeyData::from_bytes(self.keys.get(n).cloned().unwrap_or_default()))
    }

    fn put(&mut self, data: &[u8]) -> Result<()> {
        self.uploads.push(data.to_vec());
        Ok(())
    }

    fn fetch(&mut self, uri: &str) -> Result<KeyData> {
        self.fetched.push(uri.into());
        match self.keys.get(self.fetched.len() - 1) {
            Some(k) => Ok(KeyData::from_bytes(k.clone()).with_source(uri)),
            None => Err(anyhow::anyhow!("no such URI")),
        }
    }

    fn keyservers(&mut self) -> Result<Vec<String>> {
        if self.keyservers.is_empty() {
            Err(anyhow::anyhow!("no keyserver configured"))
        } else {
            Ok(self.keyservers.clone())
        }
    }
}

/// Remembers the primary keys of imported blocks.
#[derive(Debug, Default)]
pub struct RecordingImporter {
    /// Imported keys.
    pub imported: Vec<Fingerprint>,
    /// Options of each import.
    pub options: Vec<ImportOptions>,
    /// Fail every import.
    pub fail: bool,
}

impl Importer for RecordingImporter {
    fn import(&mut self, block: PacketPile, options: &ImportOptions)
              -> Result<ImportStatus> {
        self.options.push(*options);
        if self.fail {
            return Err(anyhow::anyhow!("keyring is read-only"));
        }

        match block.children().next() {
            Some(Packet::PublicKey(k)) => {
                let fpr = k.fingerprint();
                if self.imported.contains(&fpr) {
                    Ok(ImportStatus::Unchanged(fpr))
                } else if options.merge_only {
                    Ok(ImportStatus::Skipped)
                } else {
                    self.imported.push(fpr.clone());
                    Ok(ImportStatus::New(fpr))
                }
            },
            _ => Ok(ImportStatus::Skipped),
        }
    }
}

/// Replays canned answers and records what was shown.
#[derive(Debug, Default)]
pub struct ScriptedTerminal {
    answers: VecDeque<String>,
    /// Everything written.
    pub output: String,
    /// Every prompt shown.
    pub prompts: Vec<String>,
}

impl ScriptedTerminal {
    pub fn new(answers: Vec<&str>) -> Self {
        ScriptedTerminal {
            answers: answers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

impl Terminal for ScriptedTerminal {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.output.push_str(s);
        Ok(())
    }

    fn prompt(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.prompts.push(prompt.into());
        Ok(self.answers.pop_front())
    }
}
