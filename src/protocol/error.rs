use thiserror::Error;

use crate::document::DocumentError;

/// Errors raised while framing or parsing wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix is below the header size or above the configured maximum.
    #[error("invalid message length: {0}")]
    InvalidLength(i32),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(i32),

    /// The frame ended before the named field could be read.
    #[error("truncated message: missing {0}")]
    Truncated(&'static str),

    /// The frame is complete but its body is inconsistent.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("unknown OP_MSG section kind: {0}")]
    UnknownSectionKind(u8),

    #[error("invalid UTF-8 in cstring")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("invalid document: {0}")]
    Document(#[from] DocumentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
