pub mod document;
pub mod error_doc;
pub mod logging;
pub mod protocol;
pub mod server;

pub use document::{DocumentError, WireDocument};
pub use error_doc::MongoError;
