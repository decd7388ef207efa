//! Errors that know how to describe themselves as a reply document.

use bson::{Document, doc};
use thiserror::Error;

/// Well-known server error codes.
pub mod codes {
    pub const BAD_VALUE: i32 = 2;
    pub const UNAUTHORIZED: i32 = 13;
    pub const COMMAND_NOT_FOUND: i32 = 59;
}

/// A command failure carrying a numeric code, in the shape drivers expect.
///
/// Passing one to [`Session::respond_with_error`](crate::server::Session::respond_with_error)
/// sends [`to_document`](Self::to_document) verbatim instead of the generic
/// `{ok: 0, errmsg}` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MongoError {
    pub code: i32,
    pub code_name: Option<String>,
    pub message: String,
}

impl MongoError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_code_name(mut self, code_name: impl Into<String>) -> Self {
        self.code_name = Some(code_name.into());
        self
    }

    pub fn command_not_found(command: &str) -> Self {
        Self::new(
            codes::COMMAND_NOT_FOUND,
            format!("no such command: '{}'", command),
        )
        .with_code_name("CommandNotFound")
    }

    /// Reply document: `{ok: 0, errmsg, code, codeName?}`.
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "ok": 0,
            "errmsg": self.message.clone(),
            "code": self.code,
        };
        if let Some(code_name) = &self.code_name {
            doc.insert("codeName", code_name.clone());
        }
        doc
    }
}
