//! Server configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration.
///
/// Immutable once handed to [`Server::new`](crate::server::Server::new).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host or IP address to bind to.
    pub bind_host: String,
    /// Port to bind to. Zero picks an ephemeral port.
    pub bind_port: u16,
    pub tls: TlsSettings,
    /// TCP keep-alive period for accepted sockets. Zero disables keep-alive.
    pub tcp_keep_alive: Duration,
    pub logging: LogConfig,
}

/// TLS settings for accepted connections.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Certificate/key pairs; the first one is the default identity.
    pub key_pairs: Vec<TlsKeyPair>,
    /// Lowest protocol version accepted. `None` keeps the library default.
    pub min_version: Option<TlsVersion>,
}

/// Paths to a PEM certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsKeyPair {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TlsKeyPair {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }
}

/// TLS protocol versions that can be configured as a minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_start_matches("tls") {
            "1.0" | "10" => Ok(TlsVersion::Tls10),
            "1.1" | "11" => Ok(TlsVersion::Tls11),
            "1.2" | "12" => Ok(TlsVersion::Tls12),
            "1.3" | "13" => Ok(TlsVersion::Tls13),
            _ => Err(format!("unknown TLS version: {}", s)),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlsVersion::Tls10 => "1.0",
            TlsVersion::Tls11 => "1.1",
            TlsVersion::Tls12 => "1.2",
            TlsVersion::Tls13 => "1.3",
        };
        write!(f, "TLS {}", s)
    }
}

/// Output format of the stdout log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration consumed by [`logging::init`](crate::logging::init).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level or filter directive, e.g. `info` or `mongowire=debug,warn`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    pub stdout: bool,
    /// Additional sink appending plain-text lines to this file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            stdout: true,
            file: None,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration for a plain-TCP server without keep-alive.
    pub fn new(bind_host: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            tls: TlsSettings::default(),
            tcp_keep_alive: Duration::ZERO,
            logging: LogConfig::default(),
        }
    }

    /// Enables TLS with the given settings.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the TCP keep-alive period. `Duration::ZERO` disables it.
    #[must_use]
    pub fn with_tcp_keep_alive(mut self, period: Duration) -> Self {
        self.tcp_keep_alive = period;
        self
    }

    #[must_use]
    pub fn with_logging(mut self, logging: LogConfig) -> Self {
        self.logging = logging;
        self
    }

    /// The `host:port` string passed to the listener.
    pub fn bind_address(&self) -> String {
        if self.bind_host.contains(':') && !self.bind_host.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.bind_host, self.bind_port)
        } else {
            format!("{}:{}", self.bind_host, self.bind_port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 27017)
    }
}

impl TlsSettings {
    /// TLS enabled with the given key pairs.
    pub fn with_key_pairs(key_pairs: Vec<TlsKeyPair>) -> Self {
        Self {
            enabled: true,
            key_pairs,
            min_version: None,
        }
    }

    #[must_use]
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self
    }
}
