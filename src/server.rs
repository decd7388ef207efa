//! TCP/TLS server for MongoDB-compatible connections.
//!
//! This module provides the network layer that accepts client connections,
//! optionally wraps them in TLS and hands each one to a worker created by
//! the hosting deployment.
//!
//! ## Architecture
//!
//! ```text
//! +--------+
//! | Server |  <- Binds, accepts TCP connections, owns shutdown
//! +--------+
//!      |
//!      v
//! +-----------+
//! | Handshake |  <- TLS negotiation, SNI capture
//! +-----------+
//!      |
//!      v
//! +---------+     +--------+
//! | Session | <-- | Worker |  <- Reads requests, writes replies
//! +---------+     +--------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: Lifecycle owner of the listener (run, ready signal, close)
//! - **Session**: One accepted connection with its framed transport
//! - **Worker**: Deployment-supplied logic run once per session
//! - **WorkerFactory**: Shared constructor of workers
//! - **Ready signal**: One-shot notification of bind success or failure

pub mod config;
pub mod error;
mod handshake;
pub mod listener;
pub mod session;
pub mod tls;
pub mod worker;

pub use config::{LogConfig, LogFormat, ServerConfig, TlsKeyPair, TlsSettings, TlsVersion};
pub use error::{ServerError, ServerResult, SessionError, WorkerError};
pub use listener::{ReadySignal, Server};
pub use session::{Session, SessionInfo};
pub use worker::{Worker, WorkerFactory};
