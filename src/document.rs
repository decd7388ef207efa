//! Wire-ready BSON documents.
//!
//! Messages carry documents as opaque byte strings: the server rarely needs
//! to look inside a document it forwards, so decoding happens only on demand
//! through [`WireDocument::to_document`].

use std::fmt;

use bson::Document;
use bytes::Bytes;
use thiserror::Error;

/// Smallest legal BSON document: length prefix plus terminator.
pub const MIN_DOCUMENT_LEN: usize = 5;

/// The canonical empty document `{}`.
static EMPTY_DOCUMENT: [u8; MIN_DOCUMENT_LEN] = [5, 0, 0, 0, 0];

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to encode document: {0}")]
    Encode(#[from] bson::ser::Error),

    #[error("failed to decode document: {0}")]
    Decode(#[from] bson::de::Error),

    #[error("failed to build document: {0}")]
    Raw(#[from] bson::raw::Error),

    #[error("malformed document: {0}")]
    Malformed(&'static str),
}

/// An encoded BSON document.
///
/// Cloning is cheap; the bytes are shared and never mutated.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WireDocument {
    bytes: Bytes,
}

impl WireDocument {
    /// Returns the empty document `{}`.
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::from_static(&EMPTY_DOCUMENT),
        }
    }

    /// Encodes a `bson::Document`.
    pub fn from_document(doc: &Document) -> Result<Self, DocumentError> {
        let mut buf = Vec::new();
        doc.to_writer(&mut buf)?;
        Ok(Self { bytes: buf.into() })
    }

    /// Wraps already-encoded bytes after checking the length prefix and terminator.
    ///
    /// The element list itself is not validated; [`to_document`](Self::to_document)
    /// reports any corruption there.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, DocumentError> {
        if bytes.len() < MIN_DOCUMENT_LEN {
            return Err(DocumentError::Malformed("shorter than 5 bytes"));
        }
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared < 0 || declared as usize != bytes.len() {
            return Err(DocumentError::Malformed("length prefix does not match size"));
        }
        if bytes[bytes.len() - 1] != 0 {
            return Err(DocumentError::Malformed("missing terminator"));
        }
        Ok(Self { bytes })
    }

    /// Decodes the document.
    pub fn to_document(&self) -> Result<Document, DocumentError> {
        Ok(Document::from_reader(&mut self.bytes.as_ref())?)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if this is the empty document `{}`.
    pub fn is_empty(&self) -> bool {
        self.bytes.len() == MIN_DOCUMENT_LEN
    }
}

impl Default for WireDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<&Document> for WireDocument {
    type Error = DocumentError;

    fn try_from(doc: &Document) -> Result<Self, Self::Error> {
        Self::from_document(doc)
    }
}

impl fmt::Debug for WireDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_document() {
            Ok(doc) => write!(f, "WireDocument({})", doc),
            Err(_) => write!(f, "WireDocument(<{} undecodable bytes>)", self.bytes.len()),
        }
    }
}
