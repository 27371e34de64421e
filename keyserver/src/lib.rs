//! For searching and retrieving keys on keyservers.
//!
//! This crate implements the client side of the keyserver search and
//! retrieval protocol.  It does not talk to the network: requests are
//! issued by a [`Transport`], retrieved keys are stored by an
//! [`Importer`], and the user picks search results through a
//! [`Terminal`].  What this crate does is everything in between:
//!
//!   - it plans retrieval requests that fit the transport's line
//!     length limit ([`planner`]),
//!   - it parses search results ([`record`], [`search`]) and pages
//!     through them with the user ([`select`]),
//!   - it makes sure that a keyserver only gets to import what was
//!     asked for, and never secret keys ([`screener`], [`driver`]).
//!
//! # Example
//!
//! ```no_run
//! # use sequoia_keyserver::{Config, KeyServer, Result};
//! # use sequoia_keyserver::driver::Importer;
//! # use sequoia_keyserver::transport::Transport;
//! # fn f(transport: &mut dyn Transport, importer: &mut dyn Importer)
//! #      -> Result<()> {
//! let config = Config::detect();
//! let mut ks = KeyServer::new(transport, importer, &config);
//! let r = ks.import(&["0xD03F6F865226FE8B"])?;
//! println!("{}", r.stats);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

use std::collections::TryReserveError;

use log::{error, info, warn};

use sequoia_openpgp as openpgp;
use openpgp::{Fingerprint, KeyID};

mod config;
pub use config::{
    Config,
    KeyidFormat,
    KeyserverOptions,
    KeyserverSpec,
    DEFAULT_MAX_CERT_SIZE,
};
mod descriptor;
pub use descriptor::Descriptor;

pub mod driver;
pub mod planner;
pub mod record;
pub mod screener;
pub mod search;
pub mod select;
pub mod terminal;
pub mod transport;

#[cfg(test)]
mod testing;

use driver::{Exporter, ImportOptions, Importer, RetrievalDriver, Retrieved};
use search::{SearchContext, SearchController, SearchOutcome};
use terminal::Terminal;
use transport::Transport;

/// Searches and retrieves keys.
///
/// This is the front end of the crate.  It borrows the collaborators
/// for the duration of a session.
pub struct KeyServer<'a> {
    transport: &'a mut dyn Transport,
    importer: &'a mut dyn Importer,
    config: &'a Config,
}

impl<'a> KeyServer<'a> {
    /// Returns a handle using the given collaborators.
    pub fn new(transport: &'a mut dyn Transport,
               importer: &'a mut dyn Importer,
               config: &'a Config)
               -> Self
    {
        KeyServer { transport, importer, config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        self.config
    }

    fn driver(&mut self) -> RetrievalDriver {
        RetrievalDriver::new(&mut *self.transport, &mut *self.importer)
    }

    /// Returns whether the transport knows any keyserver.
    pub fn any_configured(&mut self) -> bool {
        self.transport.keyservers()
            .map(|ks| ! ks.is_empty())
            .unwrap_or(false)
    }

    /// Searches for `tokens`, lists the results, and retrieves what
    /// the user selects.
    ///
    /// The tokens are joined with spaces.
    pub fn search<S: AsRef<str>>(&mut self, tokens: &[S],
                                 terminal: &mut dyn Terminal)
                                 -> Result<SearchOutcome>
    {
        if tokens.is_empty() {
            return Ok(SearchOutcome::Completed(Vec::new()));
        }

        let search = tokens.iter().map(AsRef::as_ref)
            .collect::<Vec<&str>>().join(" ");

        let outcome = self.transport
            .search(&search, &self.config.keyserver_options)
            .and_then(|stream| {
                let mut ctx = SearchContext {
                    transport: &mut *self.transport,
                    importer: &mut *self.importer,
                    terminal,
                };
                SearchController::new(self.config, &search)
                    .run(&mut ctx, stream)
            });

        match &outcome {
            Ok(SearchOutcome::NotFound) =>
                info!("key \"{}\" not found on keyserver", search),
            Ok(_) => (),
            Err(e) => error!("error searching keyserver: {}", e),
        }
        outcome
    }

    /// Retrieves the keys named by `descriptors`.
    ///
    /// See [`RetrievalDriver::get`].
    pub fn get(&mut self, descriptors: &[Descriptor],
               keyserver: Option<&KeyserverSpec>, quick: bool)
               -> Result<Retrieved>
    {
        self.driver().get(descriptors, keyserver, quick)
    }

    /// Retrieves the keys named by key IDs or fingerprints.
    ///
    /// Tokens naming something else are skipped.
    pub fn import<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<Retrieved> {
        let mut descriptors = Vec::with_capacity(tokens.len());
        for token in tokens.iter().map(AsRef::as_ref) {
            match token.parse::<Descriptor>() {
                Ok(d) if d.is_key_identifier() => descriptors.push(d),
                _ => error!("\"{}\" not a key ID: skipping", token),
            }
        }

        if descriptors.is_empty() {
            return Ok(Retrieved::default());
        }
        self.get(&descriptors, None, false)
    }

    /// Retrieves the keys with a user ID that is exactly `name`.
    pub fn import_name(&mut self, name: &str,
                       keyserver: Option<&KeyserverSpec>)
                       -> Result<Retrieved>
    {
        self.get(&[Descriptor::ExactName(name.into())], keyserver, false)
    }

    /// Retrieves the key with the given 16 or 20 byte fingerprint.
    pub fn import_fingerprint(&mut self, fingerprint: &[u8],
                              keyserver: Option<&KeyserverSpec>,
                              quick: bool)
                              -> Result<Retrieved>
    {
        let descriptor = match fingerprint.len() {
            16 => {
                let mut raw = [0; 16];
                raw.copy_from_slice(fingerprint);
                Descriptor::Fingerprint16(raw)
            },
            20 => {
                let mut raw = [0; 20];
                raw.copy_from_slice(fingerprint);
                Descriptor::Fingerprint20(raw)
            },
            n => return Err(Error::InvalidFingerprintLength(n).into()),
        };
        self.get(&[descriptor], keyserver, quick)
    }

    /// Retrieves the key with the given key ID.
    pub fn import_keyid(&mut self, keyid: &KeyID,
                        keyserver: Option<&KeyserverSpec>, quick: bool)
                        -> Result<Retrieved>
    {
        self.get(&[Descriptor::from(keyid)], keyserver, quick)
    }

    /// Updates local keys from the keyservers.
    ///
    /// New keys are never added.
    pub fn refresh(&mut self, fingerprints: &[Fingerprint])
                   -> Result<Retrieved>
    {
        if fingerprints.is_empty() {
            return Ok(Retrieved::default());
        }

        let keyservers = self.transport.keyservers()?;
        let from = keyservers.first().ok_or(Error::NoKeyserver)?;
        info!("refreshing {} key{} from {}",
              fingerprints.len(),
              if fingerprints.len() == 1 { "" } else { "s" },
              from);

        let descriptors: Vec<Descriptor> =
            fingerprints.iter().map(Descriptor::from).collect();
        self.driver()
            .import_options(ImportOptions { merge_only: true, fast: true })
            .get(&descriptors, None, false)
    }

    /// Uploads the keys named by `users` to the configured keyserver.
    ///
    /// Only key IDs and fingerprints are accepted.  Every key is
    /// tried; if any fails, the last failure is returned.
    pub fn send<S: AsRef<str>>(&mut self, users: &[S],
                               exporter: &mut dyn Exporter)
                               -> Result<()>
    {
        let mut descriptors = Vec::with_capacity(users.len());
        for user in users.iter().map(AsRef::as_ref) {
            match user.parse::<Descriptor>() {
                Ok(d) if d.is_key_identifier() => descriptors.push(d),
                _ => error!("\"{}\" not a key ID: skipping", user),
            }
        }

        if descriptors.is_empty() {
            return Ok(());
        }

        let keyserver = match self.transport.keyservers() {
            Ok(ks) if ! ks.is_empty() => ks.join(", "),
            _ => {
                error!("no keyserver known");
                return Err(Error::NoKeyserver.into());
            },
        };

        let mut result = Ok(());
        for d in descriptors {
            let (keyid, data) = match exporter.export(&d) {
                Ok(exported) => exported,
                Err(e) => {
                    error!("skipped \"{}\": {}", d, e);
                    result = Err(e);
                    continue;
                },
            };

            info!("sending key {} to {}", keyid, keyserver);
            if let Err(e) = self.transport.put(&data) {
                error!("keyserver send failed: {}", e);
                result = Err(e);
            }
        }
        result
    }

    /// Retrieves keys from the given URIs, bypassing the keyservers.
    ///
    /// A URI that cannot be fetched is reported and skipped.
    pub fn fetch<S: AsRef<str>>(&mut self, uris: &[S]) -> Vec<Retrieved> {
        let mut retrieved = Vec::with_capacity(uris.len());
        for uri in uris.iter().map(AsRef::as_ref) {
            info!("requesting key from '{}'", uri);
            let r = self.driver()
                .import_options(ImportOptions { merge_only: false, fast: true })
                .fetch(uri);
            match r {
                Ok(r) => retrieved.push(r),
                Err(e) => warn!("unable to fetch URI {}: {}", uri, e),
            }
        }
        retrieved
    }
}

/// Results for sequoia-keyserver.
pub type Result<T> = ::std::result::Result<T, anyhow::Error>;

#[derive(thiserror::Error, Debug)]
/// Errors returned from the keyserver routines.
pub enum Error {
    /// The server speaks a different version of the search protocol.
    #[error("Invalid keyserver protocol version {0}, expected 1")]
    UnsupportedProtocol(i64),
    /// No key matched.
    #[error("Key not found")]
    NotFound,
    /// The user quit.
    #[error("Operation canceled")]
    Canceled,
    /// More keys were selected than can be retrieved at once.
    #[error("Too many keys selected, at most {0} are allowed")]
    TooManySelections(usize),
    /// A token does not name a key.
    #[error("Not a valid key search: {0:?}")]
    InvalidDescriptor(String),
    /// Memory for search results could not be allocated.
    #[error("Out of memory")]
    AllocationFailure(#[source] TryReserveError),
    /// No keyserver is configured.
    #[error("No keyserver known")]
    NoKeyserver,
    /// A given keyserver URI was malformed.
    #[error("Malformed keyserver URI")]
    MalformedUri,
    /// A `url::ParseError` occurred.
    #[error("URI Error")]
    UriError(#[from] url::ParseError),
    /// A fingerprint has an unsupported length.
    #[error("Invalid fingerprint length {0}, expected 16 or 20 bytes")]
    InvalidFingerprintLength(usize),
    /// An option could not be parsed.
    #[error("Invalid option {0:?}")]
    InvalidOption(String),
}
