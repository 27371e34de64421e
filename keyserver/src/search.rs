//! Drives a keyserver search.
//!
//! The [`SearchController`] consumes the response lines of a search
//! one at a time.  It checks the optional `info` line, turns the
//! colon records into [`KeyRecord`]s, lists them page by page, and
//! lets the user pick keys to retrieve through the
//! [`InteractiveSelector`].

use std::convert::TryFrom;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use log::{debug, error, info};

use sequoia_openpgp as openpgp;
use openpgp::types::PublicKeyAlgorithm;

use crate::{Config, Descriptor, Error, KeyidFormat, Result};
use crate::descriptor::keyid_to_u64;
use crate::driver::{Importer, Retrieved};
use crate::record::{KeyRecord, RecordParser};
use crate::select::{InteractiveSelector, Selection};
use crate::terminal::Terminal;
use crate::transport::{SearchLine, SearchStream, Transport};

/// The only supported version of the search response format.
pub const PROTOCOL_VERSION: i64 = 1;

/// Growth step of the descriptor table.
const GROWTH: usize = 10;

/// The collaborators a search needs.
pub struct SearchContext<'a> {
    /// Retrieves selected keys.
    pub transport: &'a mut dyn Transport,
    /// Stores retrieved keys.
    pub importer: &'a mut dyn Importer,
    /// Shows results and reads selections.
    pub terminal: &'a mut dyn Terminal,
}

/// How a search ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The results were listed; contains the retrievals the user
    /// asked for.
    Completed(Vec<Retrieved>),
    /// The server found nothing.
    NotFound,
    /// The user quit.
    Canceled,
}

impl SearchOutcome {
    /// Turns [`SearchOutcome::NotFound`] and
    /// [`SearchOutcome::Canceled`] into errors.
    pub fn into_result(self) -> Result<Vec<Retrieved>> {
        match self {
            SearchOutcome::Completed(r) => Ok(r),
            SearchOutcome::NotFound => Err(Error::NotFound.into()),
            SearchOutcome::Canceled => Err(Error::Canceled.into()),
        }
    }
}

/// Where the controller is in the response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing seen yet; an `info` line is still recognized.
    Start,
    /// Collecting records.
    Accumulating,
    /// Waiting for the user to pick from the records so far.
    Paginating,
    /// Finished, further lines are ignored.
    Done,
}

/// The descriptors of the records seen so far.
///
/// The table starts with room for the number of keys the server
/// announced (or [`GROWTH`] if it did not announce a usable number)
/// and grows by [`GROWTH`] entries whenever it is full.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    descriptors: Vec<Descriptor>,
    capacity: usize,
}

impl DescriptorTable {
    /// Returns the descriptors.
    pub fn as_slice(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Returns the number of descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Returns the number of descriptors the table has room for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes room for the first `n` descriptors.
    fn allocate(&mut self, n: usize) -> Result<()> {
        self.descriptors.try_reserve_exact(n)
            .map_err(Error::AllocationFailure)?;
        self.capacity = n;
        Ok(())
    }

    /// Makes room for [`GROWTH`] more descriptors.
    fn grow(&mut self) -> Result<()> {
        self.descriptors.try_reserve_exact(GROWTH)
            .map_err(Error::AllocationFailure)?;
        self.capacity += GROWTH;
        Ok(())
    }

    fn push(&mut self, descriptor: Descriptor) {
        debug_assert!(self.descriptors.len() < self.capacity);
        self.descriptors.push(descriptor);
    }
}

/// The state of a single search.
#[derive(Debug)]
pub struct SearchSession {
    search: String,
    table: DescriptorTable,
    count: usize,
    count_trusted: bool,
    numlines: usize,
    eof_seen: bool,
    not_found: bool,
}

impl SearchSession {
    fn new(search: &str) -> Self {
        SearchSession {
            search: search.into(),
            table: DescriptorTable::default(),
            count: 0,
            count_trusted: false,
            numlines: 0,
            eof_seen: false,
            not_found: false,
        }
    }

    /// Returns the search string.
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Returns the descriptors of the records seen so far.
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    /// Returns the expected number of results, if the server's
    /// announcement is still believed.
    pub fn count(&self) -> Option<usize> {
        if self.count_trusted {
            Some(self.count)
        } else {
            None
        }
    }

    /// Returns whether the server found nothing.
    pub fn not_found(&self) -> bool {
        self.not_found
    }

    /// Returns whether the end of the response was seen.
    pub fn eof_seen(&self) -> bool {
        self.eof_seen
    }

    /// Adds a descriptor, growing the table if needed.
    fn add(&mut self, descriptor: Descriptor) -> Result<()> {
        if self.table.capacity() == 0 {
            if self.count < 1 {
                self.count = GROWTH;
                self.count_trusted = false;
            }
            self.table.allocate(self.count)?;
        } else if self.table.len() == self.table.capacity() {
            // The server sent more keys than it announced.
            self.table.grow()?;
            self.count = self.table.capacity();
            self.count_trusted = false;
        }

        self.table.push(descriptor);
        Ok(())
    }
}

/// Parses a leading decimal integer like `sscanf("%d")`.
fn scan_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits.find(|c: char| ! c.is_ascii_digit())
        .unwrap_or_else(|| digits.len());
    if end == 0 {
        return None;
    }
    let n: i64 = digits[..end].parse().ok()?;
    Some(if negative { -n } else { n })
}

/// Strips `tag` from `line`, ignoring case.
fn strip_tag<'l>(line: &'l str, tag: &str) -> Option<&'l str> {
    match line.get(..tag.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(tag) =>
            Some(&line[tag.len()..]),
        _ => None,
    }
}

/// Returns the name of a public key algorithm, as shown in listings.
#[allow(deprecated)]
pub fn algorithm_name(algo: u8) -> &'static str {
    match PublicKeyAlgorithm::from(algo) {
        PublicKeyAlgorithm::RSAEncryptSign
            | PublicKeyAlgorithm::RSAEncrypt
            | PublicKeyAlgorithm::RSASign => "RSA",
        PublicKeyAlgorithm::DSA => "DSA",
        PublicKeyAlgorithm::ElGamalEncrypt
            | PublicKeyAlgorithm::ElGamalEncryptSign => "ELG",
        PublicKeyAlgorithm::ECDH => "ECDH",
        PublicKeyAlgorithm::ECDSA => "ECDSA",
        PublicKeyAlgorithm::EdDSA => "EDDSA",
        _ => "unknown",
    }
}

/// Formats `t` as a calendar date, if it can be represented.
fn date(t: SystemTime) -> Option<String> {
    let secs = i64::try_from(t.duration_since(UNIX_EPOCH).ok()?.as_secs())
        .ok()?;
    Utc.timestamp_opt(secs, 0).single()
        .map(|t| t.format("%Y-%m-%d").to_string())
}

/// Renders the key ID of a record's descriptor.
fn keyid(descriptor: &Descriptor, format: KeyidFormat) -> String {
    match descriptor {
        Descriptor::ShortKeyID(id) => format.format_short(*id),
        Descriptor::LongKeyID(id) => format.format(*id),
        Descriptor::Fingerprint16(fpr) =>
            openpgp::fmt::hex::encode(&fpr[..]),
        Descriptor::Fingerprint20(_) => descriptor.keyid()
            .and_then(|id| keyid_to_u64(&id))
            .map(|id| format.format(id))
            .unwrap_or_default(),
        d => d.to_string(),
    }
}

/// Renders a record for the result listing.
///
/// `number` is the record's 1-based position in the listing.
pub fn render(number: usize, record: &KeyRecord, format: KeyidFormat)
              -> String
{
    let mut s = format!("({})\t{}  ", number, record.display_text());

    if record.bits() > 0 {
        s.push_str(&format!("{} bit ", record.bits()));
    }
    if record.algo() != 0 {
        s.push_str(u8::try_from(record.algo())
                   .map(algorithm_name).unwrap_or("unknown"));
        s.push(' ');
    }
    s.push_str("key ");
    s.push_str(&keyid(record.descriptor(), format));

    if let Some(d) = record.created().and_then(date) {
        s.push_str(&format!(", created: {}", d));
    }
    if let Some(d) = record.expires().and_then(date) {
        s.push_str(&format!(", expires: {}", d));
    }

    let flags = record.flags();
    if flags.revoked() {
        s.push_str(" (revoked)");
    }
    if flags.disabled() {
        s.push_str(" (disabled)");
    }
    if flags.expired() {
        s.push_str(" (expired)");
    }

    s.push('\n');
    s
}

/// The search protocol state machine.
pub struct SearchController<'c> {
    config: &'c Config,
    session: SearchSession,
    parser: RecordParser,
    selector: InteractiveSelector,
    state: State,
    canceled: bool,
    retrieved: Vec<Retrieved>,
}

impl<'c> SearchController<'c> {
    /// Returns a controller for a search for `search`.
    pub fn new(config: &'c Config, search: &str) -> Self {
        SearchController {
            config,
            session: SearchSession::new(search),
            parser: RecordParser::new(config.screen_columns),
            selector: InteractiveSelector::new(),
            state: State::Start,
            canceled: false,
            retrieved: Vec::new(),
        }
    }

    /// Uses `now` instead of the system clock when deciding whether
    /// a key has expired.
    pub fn at(mut self, now: SystemTime) -> Self {
        self.parser = RecordParser::new(self.config.screen_columns).at(now);
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns the session state.
    pub fn session(&self) -> &SearchSession {
        &self.session
    }

    /// Returns whether the controller ignores further input.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Processes a response line, or the end of the response if
    /// `line` is `None`.
    pub fn handle_line(&mut self, ctx: &mut SearchContext,
                       line: Option<SearchLine>)
                       -> Result<()>
    {
        let line = match line {
            Some(SearchLine::Source(source)) => {
                info!("data source: {}", source);
                return Ok(());
            },
            Some(SearchLine::Data(_)) if self.session.eof_seen => {
                debug!("unexpected data after the end of the response");
                None
            },
            Some(SearchLine::Data(line)) => Some(line),
            None => None,
        };

        if self.is_done() {
            return Ok(());
        }

        let line = match line {
            Some(line) => line,
            None => return self.finish_stream(ctx),
        };

        if self.config.with_colons {
            ctx.terminal.write_str(&format!("{}\n", line))?;
        }

        if self.state == State::Start {
            if line.is_empty() {
                return Ok(());
            }
            self.state = State::Accumulating;
            if let Some(fields) = strip_tag(&line, "info:") {
                return self.handle_info(fields);
            }
        }

        if self.session.not_found {
            debug!("ignoring record after empty result announcement");
            return Ok(());
        }

        if let Some(record) = self.parser.feed(Some(&line)) {
            self.add_record(ctx, record)?;
        }
        Ok(())
    }

    /// Checks the `info` line.
    fn handle_info(&mut self, fields: &str) -> Result<()> {
        let mut fields = fields.split(':');

        if let Some(version) = fields.next() {
            let version = scan_int(version).unwrap_or(PROTOCOL_VERSION);
            if version != PROTOCOL_VERSION {
                error!("invalid keyserver protocol (us {}!=handler {})",
                       PROTOCOL_VERSION, version);
                self.state = State::Done;
                return Err(Error::UnsupportedProtocol(version).into());
            }
        }

        if let Some(count) = fields.next().and_then(scan_int) {
            if count == 0 {
                self.session.not_found = true;
            } else if count < 0 {
                self.session.count = GROWTH;
            } else {
                self.session.count = count as usize;
                self.session.count_trusted = true;
            }
        }

        Ok(())
    }

    /// Stores, pages and shows a completed record.
    fn add_record(&mut self, ctx: &mut SearchContext, record: KeyRecord)
                  -> Result<()>
    {
        self.session.add(record.descriptor().clone())?;
        let nkeys = self.session.table.len();

        if ! self.config.with_colons {
            // One line is needed for the prompt.
            if self.session.numlines + record.lines()
                > self.config.screen_lines.saturating_sub(1)
            {
                if self.config.interactive() {
                    self.select(ctx, nkeys - 1)?;
                    if self.is_done() {
                        return Ok(());
                    }
                }
                self.session.numlines = 0;
            }

            ctx.terminal.write_str(
                &render(nkeys, &record, self.config.keyid_format))?;
        }

        self.session.numlines += record.lines();
        Ok(())
    }

    /// Flushes the parser and shows the final prompt.
    fn finish_stream(&mut self, ctx: &mut SearchContext) -> Result<()> {
        self.session.eof_seen = true;

        while let Some(record) = self.parser.feed(None) {
            self.add_record(ctx, record)?;
            if self.is_done() {
                return Ok(());
            }
        }

        if self.session.table.is_empty() {
            self.session.not_found = true;
        } else {
            if self.session.table.len() != self.session.count {
                self.session.count_trusted = false;
            }

            if self.config.interactive() {
                self.select(ctx, self.session.table.len())?;
            }
        }

        self.state = State::Done;
        Ok(())
    }

    /// Lets the user pick from the first `shown` records.
    fn select(&mut self, ctx: &mut SearchContext, shown: usize)
              -> Result<()>
    {
        let previous = self.state;
        self.state = State::Paginating;
        let count = self.session.count();
        let selection = self.selector.run(
            ctx, &self.session.table.as_slice()[..shown], count,
            &self.session.search);
        self.state = previous;

        match selection? {
            Selection::Next => (),
            Selection::Retrieved(r) => self.retrieved.push(r),
            Selection::Canceled => {
                self.canceled = true;
                self.state = State::Done;
            },
        }
        Ok(())
    }

    /// Feeds `stream` to the controller until it is done.
    ///
    /// The stream is dropped, and thus closed, as soon as the search
    /// ends, even if the server is still sending.
    pub fn run(mut self, ctx: &mut SearchContext, stream: SearchStream)
               -> Result<SearchOutcome>
    {
        for line in stream {
            self.handle_line(ctx, Some(line?))?;
            if self.is_done() {
                break;
            }
        }

        if ! self.is_done() {
            self.handle_line(ctx, None)?;
        }

        Ok(self.finish())
    }

    /// Returns the outcome.
    pub fn finish(self) -> SearchOutcome {
        if self.canceled {
            SearchOutcome::Canceled
        } else if self.session.not_found {
            SearchOutcome::NotFound
        } else {
            SearchOutcome::Completed(self.retrieved)
        }
    }
}
