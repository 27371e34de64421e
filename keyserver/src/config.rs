//! Engine configuration.
//!
//! [`Config`] collects the settings the search and retrieval engine
//! consults: the screen geometry used for paging, the output mode,
//! the key ID format, the keyserver options and the configured
//! keyservers.

use std::fmt;
use std::str::FromStr;

use log::{debug, info};
use url::Url;

use crate::{Error, Result};

/// Default for the `max-cert-size` keyserver option.
///
/// Some commonly used test keys are larger than 32k.
pub const DEFAULT_MAX_CERT_SIZE: usize = 65536;

/// Width assumed if the terminal size cannot be determined.
pub const DEFAULT_SCREEN_COLUMNS: usize = 80;

/// Height assumed if the terminal size cannot be determined.
pub const DEFAULT_SCREEN_LINES: usize = 24;

/// How key IDs are rendered in search results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyidFormat {
    /// Eight hex digits.
    Short,
    /// Eight hex digits with a `0x` prefix.
    ZeroXShort,
    /// Sixteen hex digits.
    Long,
    /// Sixteen hex digits with a `0x` prefix.
    ZeroXLong,
}

impl Default for KeyidFormat {
    fn default() -> Self {
        KeyidFormat::Long
    }
}

impl KeyidFormat {
    /// Formats a 64 bit key ID.
    pub fn format(&self, keyid: u64) -> String {
        match self {
            KeyidFormat::Short => format!("{:08X}", keyid as u32),
            KeyidFormat::ZeroXShort => format!("0x{:08X}", keyid as u32),
            KeyidFormat::Long => format!("{:016X}", keyid),
            KeyidFormat::ZeroXLong => format!("0x{:016X}", keyid),
        }
    }

    /// Formats the low 32 bits of a key ID.
    ///
    /// If only a short key ID is known, it is shown as is, but the
    /// `0x` prefix is still honored.
    pub fn format_short(&self, keyid: u32) -> String {
        match self {
            KeyidFormat::ZeroXShort | KeyidFormat::ZeroXLong =>
                format!("0x{:08X}", keyid),
            KeyidFormat::Short | KeyidFormat::Long =>
                format!("{:08X}", keyid),
        }
    }
}

impl FromStr for KeyidFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "short" => Ok(KeyidFormat::Short),
            "0xshort" => Ok(KeyidFormat::ZeroXShort),
            "long" => Ok(KeyidFormat::Long),
            "0xlong" => Ok(KeyidFormat::ZeroXLong),
            _ => Err(Error::InvalidOption(s.into()).into()),
        }
    }
}

/// Options controlling keyserver operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyserverOptions {
    /// Include revoked keys in search results.
    pub include_revoked: bool,
    /// Include subkeys when searching by key ID.
    pub include_subkeys: bool,
    /// Retrieve keys automatically when verifying signatures.
    pub auto_key_retrieve: bool,
    /// Overrides the transport's timeout, in seconds.
    pub timeout: Option<u32>,
    /// Overrides the transport's proxy settings.
    pub http_proxy: Option<String>,
    /// Largest certificate the transport should accept.
    pub max_cert_size: usize,
}

impl Default for KeyserverOptions {
    fn default() -> Self {
        KeyserverOptions {
            include_revoked: false,
            include_subkeys: false,
            auto_key_retrieve: false,
            timeout: None,
            http_proxy: None,
            max_cert_size: DEFAULT_MAX_CERT_SIZE,
        }
    }
}

impl KeyserverOptions {
    /// Parses a comma or space separated option list.
    ///
    /// Unknown and obsolete options are logged and ignored.
    pub fn parse(options: &str) -> Result<Self> {
        let mut o = Self::default();
        o.apply(options)?;
        Ok(o)
    }

    /// Applies a comma or space separated option list to `self`.
    pub fn apply(&mut self, options: &str) -> Result<()> {
        for token in split_options(options) {
            let (name, value) = match token.find('=') {
                Some(i) => (&token[..i], Some(&token[i + 1..])),
                None => (token, None),
            };

            let (enable, flag) = match name.strip_prefix("no-") {
                Some(flag) => (false, flag),
                None => (true, name),
            };

            match flag {
                "include-revoked" => self.include_revoked = enable,
                "include-subkeys" => self.include_subkeys = enable,
                "auto-key-retrieve" => self.auto_key_retrieve = enable,
                "timeout" if ! enable => self.timeout = None,
                "timeout" => {
                    let value = value
                        .ok_or_else(|| Error::InvalidOption(token.into()))?;
                    self.timeout = Some(value.parse().map_err(
                        |_| Error::InvalidOption(token.into()))?);
                },
                "http-proxy" if ! enable => self.http_proxy = None,
                "http-proxy" => {
                    self.http_proxy = value
                        .filter(|v| ! v.is_empty())
                        .map(Into::into);
                },
                "max-cert-size" => {
                    self.max_cert_size = value
                        .and_then(|v| v.parse().ok())
                        .filter(|&v| v > 0)
                        .unwrap_or(DEFAULT_MAX_CERT_SIZE);
                },
                _ => warn_helper_option(token, true),
            }
        }

        Ok(())
    }
}

impl FromStr for KeyserverOptions {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn split_options(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c == ',' || c.is_ascii_whitespace())
        .filter(|t| ! t.is_empty())
}

/// Reports options meant for the keyserver helpers of old versions.
fn warn_helper_option(option: &str, noisy: bool) {
    let name = option.split('=').next().unwrap_or(option);
    match name {
        "ca-cert-file" =>
            info!("keyserver option '{}' is obsolete; please use \
                   '{}' in the transport's configuration",
                  name, "hkp-cacert"),
        "check-cert" | "broken-http-proxy" =>
            info!("keyserver option '{}' is obsolete", name),
        _ if noisy => info!("keyserver option '{}' is unknown", name),
        _ => debug!("keyserver option '{}' is unknown", name),
    }
}

/// A keyserver address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyserverSpec {
    uri: Url,
}

impl KeyserverSpec {
    /// Parses a keyserver URI.
    ///
    /// A missing scheme defaults to `hkp`, and `x-hkp` is an alias
    /// for `hkp`.  Anything after the first space is a legacy option
    /// list, which is reported and ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (uri, options) = match s.find(' ') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };

        for option in options.into_iter().flat_map(split_options) {
            warn_helper_option(option, false);
        }

        if uri.is_empty() {
            return Err(Error::MalformedUri.into());
        }

        // "host:port" parses as a URL with scheme "host".
        let mut uri: Url = match uri.parse::<Url>() {
            Ok(u) if u.host_str().is_some() => u,
            _ => format!("hkp://{}", uri).parse()?,
        };

        if uri.scheme() == "x-hkp" {
            uri.set_scheme("hkp").map_err(|_| Error::MalformedUri)?;
        }

        if uri.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(Error::MalformedUri.into());
        }

        Ok(KeyserverSpec { uri })
    }

    /// Returns the URI scheme.
    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        self.uri.host_str().unwrap_or("")
    }

    /// Returns the explicitly given port.
    pub fn port(&self) -> Option<u16> {
        self.uri.port()
    }

    /// Returns the URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Returns whether `self` and `other` name the same server.
    pub fn same_server(&self, other: &KeyserverSpec) -> bool {
        self.scheme().eq_ignore_ascii_case(other.scheme())
            && self.host().eq_ignore_ascii_case(other.host())
            && self.port() == other.port()
    }
}

impl FromStr for KeyserverSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyserverSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Settings for the search and retrieval engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Terminal width, used to truncate user IDs.
    pub screen_columns: usize,
    /// Terminal height, used to page search results.
    pub screen_lines: usize,
    /// Emit raw colon records instead of formatted listings.
    pub with_colons: bool,
    /// Never prompt.
    pub batch: bool,
    /// How key IDs are shown.
    pub keyid_format: KeyidFormat,
    /// Keyserver options.
    pub keyserver_options: KeyserverOptions,
    /// Configured keyservers.
    pub keyservers: Vec<KeyserverSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            screen_columns: DEFAULT_SCREEN_COLUMNS,
            screen_lines: DEFAULT_SCREEN_LINES,
            with_colons: false,
            batch: false,
            keyid_format: KeyidFormat::default(),
            keyserver_options: KeyserverOptions::default(),
            keyservers: Vec::new(),
        }
    }
}

impl Config {
    /// Returns the default configuration sized to the terminal on
    /// stdout, if there is one.
    pub fn detect() -> Self {
        let mut config = Self::default();
        if let Some((w, h)) = term_size::dimensions_stdout() {
            config.screen_columns = w;
            config.screen_lines = h;
        }
        config
    }

    /// Returns whether records are rendered and prompts are shown.
    pub fn interactive(&self) -> bool {
        ! self.with_colons && ! self.batch
    }

    /// Returns the configured keyserver naming the same server as
    /// `spec`, or `spec` itself.
    pub fn match_keyserver<'a>(&'a self, spec: &'a KeyserverSpec)
                               -> &'a KeyserverSpec {
        self.keyservers.iter()
            .find(|ks| ks.same_server(spec))
            .unwrap_or(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyid_formats() {
        let id = 0xD03F6F865226FE8B;
        assert_eq!(KeyidFormat::Short.format(id), "5226FE8B");
        assert_eq!(KeyidFormat::ZeroXShort.format(id), "0x5226FE8B");
        assert_eq!(KeyidFormat::Long.format(id), "D03F6F865226FE8B");
        assert_eq!(KeyidFormat::ZeroXLong.format(id), "0xD03F6F865226FE8B");
        assert_eq!(KeyidFormat::Long.format_short(0x5226FE8B), "5226FE8B");
        assert_eq!(KeyidFormat::ZeroXLong.format_short(0x5226FE8B),
                   "0x5226FE8B");

        assert_eq!("0XLONG".parse::<KeyidFormat>().unwrap(),
                   KeyidFormat::ZeroXLong);
        assert!("none".parse::<KeyidFormat>().is_err());
    }

    #[test]
    fn options() {
        let o = KeyserverOptions::parse(
            "include-revoked, include-subkeys no-auto-key-retrieve,timeout=30")
            .unwrap();
        assert!(o.include_revoked);
        assert!(o.include_subkeys);
        assert!(! o.auto_key_retrieve);
        assert_eq!(o.timeout, Some(30));
        assert_eq!(o.max_cert_size, DEFAULT_MAX_CERT_SIZE);

        let o = KeyserverOptions::parse(
            "http-proxy=http://proxy:3128 max-cert-size=100000").unwrap();
        assert_eq!(o.http_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(o.max_cert_size, 100000);

        let o = KeyserverOptions::parse("max-cert-size=0").unwrap();
        assert_eq!(o.max_cert_size, DEFAULT_MAX_CERT_SIZE);
        let o = KeyserverOptions::parse("max-cert-size=lots").unwrap();
        assert_eq!(o.max_cert_size, DEFAULT_MAX_CERT_SIZE);

        let mut o = KeyserverOptions::parse("include-revoked").unwrap();
        o.apply("no-include-revoked").unwrap();
        assert!(! o.include_revoked);
    }

    #[test]
    fn obsolete_and_unknown_options_are_ignored() {
        let o = KeyserverOptions::parse(
            "ca-cert-file=/etc/ca.pem check-cert broken-http-proxy frobnicate")
            .unwrap();
        assert_eq!(o, KeyserverOptions::default());
    }

    #[test]
    fn malformed_options() {
        assert!(KeyserverOptions::parse("timeout").is_err());
        assert!(KeyserverOptions::parse("timeout=soon").is_err());
    }

    #[test]
    fn keyserver_uris() {
        let ks = KeyserverSpec::parse("keys.example.org").unwrap();
        assert_eq!(ks.scheme(), "hkp");
        assert_eq!(ks.host(), "keys.example.org");
        assert_eq!(ks.port(), None);

        let ks = KeyserverSpec::parse("keys.example.org:11371").unwrap();
        assert_eq!(ks.scheme(), "hkp");
        assert_eq!(ks.port(), Some(11371));

        let ks = KeyserverSpec::parse("x-hkp://keys.example.org").unwrap();
        assert_eq!(ks.scheme(), "hkp");

        let ks = KeyserverSpec::parse("hkps://keys.example.org").unwrap();
        assert_eq!(ks.scheme(), "hkps");

        let ks = KeyserverSpec::parse(
            "hkp://keys.example.org include-revoked").unwrap();
        assert_eq!(ks.host(), "keys.example.org");

        assert!(KeyserverSpec::parse("").is_err());
        assert!(KeyserverSpec::parse("   ").is_err());
    }

    #[test]
    fn matching_keyservers() {
        let mut config = Config::default();
        config.keyservers.push(
            KeyserverSpec::parse("hkps://Keys.Example.org").unwrap());

        let ks = KeyserverSpec::parse("hkps://keys.example.org").unwrap();
        assert!(std::ptr::eq(config.match_keyserver(&ks),
                             &config.keyservers[0]));

        let other = KeyserverSpec::parse("hkp://keys.example.org").unwrap();
        assert!(std::ptr::eq(config.match_keyserver(&other), &other));
    }

    #[test]
    fn interactive() {
        let mut config = Config::default();
        assert!(config.interactive());
        config.batch = true;
        assert!(! config.interactive());
    }
}
