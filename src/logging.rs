//! Process-wide log subscriber setup.
//!
//! Server code only emits `tracing` events. Each session's events carry the
//! `server` and `session` span fields (bind address, remote address, SNI
//! name), which the sinks render as a per-connection prefix.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::server::config::{LogConfig, LogFormat};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level {level:?}: {source}")]
    Filter {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("cannot open log file {}: {source}", path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("a global logger is already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.level` when set. The file sink never uses
/// ANSI colours and always appends.
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|source| LoggingError::Filter {
            level: config.level.clone(),
            source,
        })?,
    };

    let stdout_text = (config.stdout && config.format == LogFormat::Text).then(fmt::layer);
    let stdout_json = (config.stdout && config.format == LogFormat::Json).then(|| fmt::layer().json());

    let file = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_text)
        .with(stdout_json)
        .with(file)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LogConfig {
            level: "mongowire=notalevel".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(init(&config), Err(LoggingError::Filter { .. })));
    }

    #[test]
    fn test_unwritable_file() {
        let config = LogConfig {
            file: Some(PathBuf::from("/nonexistent/dir/server.log")),
            ..LogConfig::default()
        };
        assert!(matches!(init(&config), Err(LoggingError::File { .. })));
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let config = LogConfig {
            level: "trace".to_string(),
            stdout: false,
            file: Some(path.clone()),
            ..LogConfig::default()
        };

        match init(&config) {
            Ok(()) => {}
            // A subscriber from another test is already installed
            Err(LoggingError::Init(_)) => return,
            Err(e) => panic!("init failed: {}", e),
        }
        tracing::error!(marker = "file-sink-test", "written to file");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("written to file"));
        assert!(!contents.contains("\u{1b}["));
    }
}
