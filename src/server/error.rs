//! Server and session error types.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::document::DocumentError;
use crate::protocol::{ProtocolError, UnsupportedOpcode};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error returned by a [`WorkerFactory`](crate::server::WorkerFactory).
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that stop the server.
///
/// Cloneable so the same value can be delivered through the ready signal and
/// returned from [`Server::run`](crate::server::Server::run).
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// TLS is enabled but no certificate/key pair is configured.
    #[error("no ssl keys configured")]
    NoTlsKeys,

    /// A certificate/key pair could not be loaded.
    #[error("cannot load key pair from {} {}: {reason}", cert.display(), key.display())]
    TlsKeyPair {
        cert: PathBuf,
        key: PathBuf,
        reason: String,
    },

    /// The TLS configuration was rejected.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Bind failed.
    #[error("cannot start listening on {addr}: {source}")]
    Bind {
        addr: String,
        source: Arc<std::io::Error>,
    },

    /// The listener stopped accepting.
    #[error("could not accept: {0}")]
    Accept(Arc<std::io::Error>),

    /// The server stopped before it started listening.
    #[error("server is not running")]
    NotStarted,
}

/// Errors returned by the respond and read paths of a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The flattened name/value list has an odd length.
    #[error("reply document needs an even number of arguments, got {0}")]
    OddArgumentCount(usize),

    /// A name position in the flattened list does not hold a string.
    #[error("got a non string for document field name at index {index}: {found}")]
    NonStringKey { index: usize, found: String },

    #[error(transparent)]
    UnsupportedOpcode(#[from] UnsupportedOpcode),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),
}

impl From<bson::ser::Error> for SessionError {
    fn from(e: bson::ser::Error) -> Self {
        SessionError::Document(DocumentError::Encode(e))
    }
}
