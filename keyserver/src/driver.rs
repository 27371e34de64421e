//! Retrieves keys in batches and hands them to the importer.
//!
//! The [`RetrievalDriver`] plans requests with the
//! [`BatchPlanner`], sends them one after the other to the
//! [`Transport`], splits the returned key material into key blocks,
//! screens every block against the batch's descriptors, and passes
//! the survivors to the [`Importer`].

use std::fmt;

use log::{debug, info, warn};

use sequoia_openpgp as openpgp;
use openpgp::{Fingerprint, KeyID, Packet, PacketPile};
use openpgp::parse::Parse;

use crate::{Descriptor, KeyserverSpec, Result};
use crate::planner::{Batch, BatchPlanner};
use crate::screener::{self, Candidate};
use crate::transport::{GetRequest, KeyData, Transport};

/// Hints for the importer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Only update keys that are already present.
    pub merge_only: bool,
    /// Skip expensive work like trust database updates.
    pub fast: bool,
}

/// What the importer did with a key block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportStatus {
    /// A new key was added.
    New(Fingerprint),
    /// An existing key got new components.
    Updated(Fingerprint),
    /// An existing key did not change.
    Unchanged(Fingerprint),
    /// The block was not imported, e.g. because it was unknown and
    /// only merging was allowed.
    Skipped,
}

/// Stores key blocks.
pub trait Importer {
    /// Imports a key block.
    ///
    /// The block never contains a secret primary key.
    fn import(&mut self, block: PacketPile, options: &ImportOptions)
              -> Result<ImportStatus>;
}

/// Reads keys from the local keyring for upload.
pub trait Exporter {
    /// Exports the public key named by `descriptor`.
    ///
    /// Returns the key's ID and its serialized form.
    fn export(&mut self, descriptor: &Descriptor) -> Result<(KeyID, Vec<u8>)>;
}

/// Import statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Key blocks seen.
    pub processed: usize,
    /// New keys.
    pub imported: usize,
    /// Existing keys that got new components.
    pub updated: usize,
    /// Existing keys that did not change.
    pub unchanged: usize,
    /// Blocks the importer skipped.
    pub skipped: usize,
    /// Blocks refused because they did not match the request.
    pub rejected: usize,
    /// Blocks refused because they contained secret keys.
    pub secret_rejected: usize,
    /// Blocks the importer failed on.
    pub errors: usize,
}

impl ImportStats {
    fn record(&mut self, status: &ImportStatus) {
        match status {
            ImportStatus::New(_) => self.imported += 1,
            ImportStatus::Updated(_) => self.updated += 1,
            ImportStatus::Unchanged(_) => self.unchanged += 1,
            ImportStatus::Skipped => self.skipped += 1,
        }
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Total number processed: {}", self.processed)?;
        let counters = [
            ("imported", self.imported),
            ("updated", self.updated),
            ("unchanged", self.unchanged),
            ("skipped", self.skipped),
            ("not requested", self.rejected),
            ("secret keys refused", self.secret_rejected),
            ("failed", self.errors),
        ];
        for (label, n) in counters.iter().filter(|(_, n)| *n > 0) {
            write!(f, "\n{:>22}: {}", label, n)?;
        }
        Ok(())
    }
}

/// The result of a retrieval.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Retrieved {
    /// Aggregated import statistics.
    pub stats: ImportStats,
    /// The imported key, if exactly one was imported.
    pub fingerprint: Option<Fingerprint>,
}

/// Context attached to the error of a failed retrieval batch.
///
/// ```
/// # use sequoia_keyserver::driver::BatchFailure;
/// # fn f(err: anyhow::Error) {
/// if let Some(failure) = err.downcast_ref::<BatchFailure>() {
///     if let Some(stats) = failure.partial() {
///         println!("before the failure:\n{}", stats);
///     }
/// }
/// # }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFailure {
    batch: usize,
    first: Option<Descriptor>,
    partial: Option<ImportStats>,
}

impl BatchFailure {
    /// Returns the zero-based number of the failed batch.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Returns the first descriptor of the failed batch.
    pub fn first(&self) -> Option<&Descriptor> {
        self.first.as_ref()
    }

    /// Returns the statistics of the batches that succeeded before.
    pub fn partial(&self) -> Option<&ImportStats> {
        self.partial.as_ref()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Retrieving batch {}", self.batch + 1)?;
        if let Some(first) = &self.first {
            write!(f, " starting at {}", first)?;
        }
        write!(f, " failed")?;
        if let Some(stats) = &self.partial {
            write!(f, " after importing {} key(s)",
                   stats.imported + stats.updated + stats.unchanged)?;
        }
        Ok(())
    }
}

/// Start of an ASCII armor header line.
const ARMOR_HEADER: &[u8] = b"-----BEGIN PGP ";

/// Splits a response into separately parseable sections.
///
/// Keyservers answer a multi-pattern request with one armored block
/// per key.  Every armored block becomes a section; non-whitespace
/// data in front of the first one becomes a section of its own.
/// Binary data is a single section.
pub(crate) fn sections(bytes: &[u8]) -> Vec<&[u8]> {
    // The first octet of a binary packet has the high bit set.
    if bytes.first().map(|b| b & 0x80 != 0).unwrap_or(true) {
        return if bytes.is_empty() { Vec::new() } else { vec![bytes] };
    }

    let starts: Vec<usize> = (0..bytes.len())
        .filter(|&i| bytes[i..].starts_with(ARMOR_HEADER)
                && (i == 0 || bytes[i - 1] == b'\n'))
        .collect();

    let mut sections = Vec::with_capacity(starts.len() + 1);
    let first = starts.first().cloned().unwrap_or_else(|| bytes.len());
    if ! bytes[..first].iter().all(u8::is_ascii_whitespace) {
        sections.push(&bytes[..first]);
    }
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).cloned().unwrap_or_else(|| bytes.len());
        sections.push(&bytes[start..end]);
    }
    sections
}

/// Parses every section of a response.
///
/// Sections that cannot be parsed are logged and skipped.
fn parse_response(bytes: &[u8]) -> PacketPile {
    let mut packets = Vec::new();
    for section in sections(bytes) {
        match PacketPile::from_bytes(section) {
            Ok(pile) => packets.extend(pile.into_children()),
            Err(e) => warn!("skipping invalid OpenPGP data: {}", e),
        }
    }
    PacketPile::from(packets)
}

/// Splits packets into key blocks.
///
/// Every primary key starts a new block.  Packets in front of the
/// first primary key are dropped.
pub(crate) fn key_blocks(pile: PacketPile) -> Vec<Vec<Packet>> {
    let mut blocks: Vec<Vec<Packet>> = Vec::new();
    for p in pile.into_children() {
        match p {
            Packet::PublicKey(_) | Packet::SecretKey(_) => blocks.push(vec![p]),
            p => match blocks.last_mut() {
                Some(block) => block.push(p),
                None => debug!("dropping {} packet outside of a key block",
                               p.tag()),
            },
        }
    }
    blocks
}

/// Runs retrievals.
pub struct RetrievalDriver<'a> {
    transport: &'a mut dyn Transport,
    importer: &'a mut dyn Importer,
    options: ImportOptions,
    imported: Vec<Fingerprint>,
}

impl<'a> RetrievalDriver<'a> {
    /// Returns a driver using the given collaborators.
    pub fn new(transport: &'a mut dyn Transport,
               importer: &'a mut dyn Importer)
               -> Self
    {
        RetrievalDriver {
            transport,
            importer,
            options: ImportOptions::default(),
            imported: Vec::new(),
        }
    }

    /// Sets the import options.
    pub fn import_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    /// Retrieves and imports the keys named by `descriptors`.
    ///
    /// Requests go to `keyserver` if given, otherwise to the
    /// transport's configured keyservers.  The first failing batch
    /// ends the retrieval; its error carries a [`BatchFailure`]
    /// context with the statistics of the batches before it.
    pub fn get(&mut self, descriptors: &[Descriptor],
               keyserver: Option<&KeyserverSpec>, quick: bool)
               -> Result<Retrieved>
    {
        let mut stats = ImportStats::default();
        let mut any_good = false;
        self.imported.clear();

        for (n, batch) in BatchPlanner::new(descriptors).enumerate() {
            if batch.is_empty() {
                continue;
            }

            if let Err(e) = self.get_batch(&batch, keyserver, quick, &mut stats) {
                let partial = if any_good {
                    info!("{}", stats);
                    Some(stats)
                } else {
                    None
                };
                return Err(e.context(BatchFailure {
                    batch: n,
                    first: batch.patterns().first()
                        .map(|p| p.descriptor().clone()),
                    partial,
                }));
            }
            any_good = true;
        }

        if any_good {
            info!("{}", stats);
        }

        Ok(Retrieved {
            stats,
            fingerprint: self.single_fingerprint(),
        })
    }

    /// Imports key material fetched directly from `uri`.
    ///
    /// The material is not checked against any request, but secret
    /// keys are still refused.
    pub fn fetch(&mut self, uri: &str) -> Result<Retrieved> {
        let mut stats = ImportStats::default();
        self.imported.clear();

        let data = self.transport.fetch(uri)?;
        self.import(data, &[], &mut stats)?;
        info!("{}", stats);

        Ok(Retrieved {
            stats,
            fingerprint: self.single_fingerprint(),
        })
    }

    fn single_fingerprint(&self) -> Option<Fingerprint> {
        match self.imported.as_slice() {
            [fpr] => Some(fpr.clone()),
            _ => None,
        }
    }

    fn get_batch(&mut self, batch: &Batch, keyserver: Option<&KeyserverSpec>,
                 quick: bool, stats: &mut ImportStats)
                 -> Result<()>
    {
        if let Some(ks) = keyserver {
            for p in batch.patterns().iter().filter(|p| ! p.is_quiet()) {
                info!("requesting key {} from {} server {}",
                      p.descriptor(), ks.scheme(), ks.host());
            }
        }

        let request = GetRequest {
            patterns: batch.to_strings(),
            keyserver: keyserver.cloned(),
            quick,
        };
        let data = self.transport.get(&request)?;

        let requested: Vec<Descriptor> = batch.patterns().iter()
            .map(|p| p.descriptor().clone())
            .collect();
        self.import(data, &requested, stats)
    }

    fn import(&mut self, data: KeyData, requested: &[Descriptor],
              stats: &mut ImportStats)
              -> Result<()>
    {
        if let Some(source) = data.source() {
            info!("data source: {}", source);
        }

        let bytes = data.into_bytes()?;
        let blocks = key_blocks(parse_response(&bytes));
        if blocks.is_empty() {
            warn!("no valid OpenPGP data found");
            return Ok(());
        }

        for block in blocks {
            stats.processed += 1;

            let candidate = Candidate::from_packets(&block);
            if candidate.is_secret() {
                warn!("refusing secret key material from the keyserver");
                stats.secret_rejected += 1;
                continue;
            }
            if ! screener::accept(requested, &candidate) {
                let name = candidate.keys().first()
                    .map(|(fpr, _)| fpr.to_hex())
                    .unwrap_or_default();
                info!("key {} was not requested: skipped", name);
                stats.rejected += 1;
                continue;
            }

            match self.importer.import(PacketPile::from(block), &self.options) {
                Ok(status) => {
                    stats.record(&status);
                    match status {
                        ImportStatus::New(fpr)
                            | ImportStatus::Updated(fpr)
                            | ImportStatus::Unchanged(fpr) =>
                            self.imported.push(fpr),
                        ImportStatus::Skipped => (),
                    }
                },
                Err(e) => {
                    warn!("importing key failed: {}", e);
                    stats.errors += 1;
                },
            }
        }

        Ok(())
    }
}
