//! Pluggable per-connection behaviour.

use std::future::Future;

use crate::server::error::WorkerError;
use crate::server::session::{Session, SessionInfo};

/// Per-connection logic supplied by the hosting deployment.
///
/// A worker typically loops on [`Session::read_message`] and answers each
/// request through the session's respond methods.
pub trait Worker: Send {
    /// Serves the connection. The session ends when this returns.
    fn run(&mut self, session: &mut Session) -> impl Future<Output = ()> + Send;

    /// Releases resources held by the worker.
    ///
    /// Called exactly once after [`run`](Self::run) returns or panics.
    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Creates one [`Worker`] per accepted connection.
///
/// Shared by every session and invoked concurrently, so implementations must
/// not rely on external synchronisation.
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: Worker + 'static;

    /// Creates the worker for a session whose handshake has completed.
    ///
    /// An error ends the session without running a worker.
    fn create_worker(
        &self,
        session: &SessionInfo,
    ) -> impl Future<Output = Result<Self::Worker, WorkerError>> + Send;
}
