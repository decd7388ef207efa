use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::server::config::ServerConfig;
use crate::server::error::{ServerError, ServerResult};
use crate::server::handshake::Incoming;
use crate::server::session;
use crate::server::tls;
use crate::server::worker::WorkerFactory;

type ReadyState = Option<ServerResult<SocketAddr>>;

/// TCP server implementing the MongoDB wire protocol.
///
/// Lifecycle: construct once, drive [`run`](Self::run) on a task, wait on
/// [`init_channel`](Self::init_channel) until it is listening, then stop it
/// with [`close`](Self::close). A server is not reusable after `run` returns.
///
/// Shutdown stops accepting only. Sessions already running are not
/// interrupted and end on their own.
pub struct Server<F: WorkerFactory> {
    config: ServerConfig,
    factory: Arc<F>,
    ready: watch::Sender<ReadyState>,
    shutdown: CancellationToken,
    done: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

/// Resolves once the server is accepting, or failed to start.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<ReadyState>,
}

impl ReadySignal {
    /// Waits for the outcome of startup.
    ///
    /// Returns the bound address, which carries the real port when the
    /// server was configured with port 0.
    pub async fn wait(mut self) -> ServerResult<SocketAddr> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone().unwrap_or(Err(ServerError::NotStarted)),
            // Server dropped without ever starting
            Err(_) => Err(ServerError::NotStarted),
        }
    }
}

impl<F: WorkerFactory> Server<F> {
    pub fn new(config: ServerConfig, factory: F) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            config,
            factory: Arc::new(factory),
            ready,
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is bound to, once [`run`](Self::run) has
    /// started listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// The startup signal. Every handle observes the same single outcome.
    pub fn init_channel(&self) -> ReadySignal {
        ReadySignal {
            rx: self.ready.subscribe(),
        }
    }

    /// Listens and accepts connections until [`close`](Self::close) is called.
    ///
    /// Startup failures are delivered through the ready signal and returned.
    pub async fn run(&self) -> ServerResult<()> {
        // Fires on every exit path, including early returns and panics
        let _done = self.done.clone().drop_guard();

        let span = info_span!("server", addr = %self.config.bind_address());
        async {
            let (listener, acceptor) = match self.start().await {
                Ok(started) => started,
                Err(e) => {
                    error!("failed to start: {}", e);
                    self.fire_ready(Err(e.clone()));
                    return Err(e);
                }
            };

            let result = self.accept_loop(&listener, acceptor).await;
            drop(listener);
            match &result {
                Ok(()) => info!("stopped listening"),
                Err(e) => error!("stopped listening: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Requests shutdown and waits until [`run`](Self::run) has returned.
    ///
    /// Must only be called while `run` is being driven or after it returned.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.done.cancelled().await;
    }

    async fn start(&self) -> ServerResult<(TcpListener, Option<TlsAcceptor>)> {
        let acceptor = if self.config.tls.enabled {
            Some(tls::build_acceptor(&self.config.tls)?)
        } else {
            None
        };

        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| ServerError::Bind {
            addr: addr.clone(),
            source: Arc::new(e),
        })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr,
            source: Arc::new(e),
        })?;

        let _ = self.local_addr.set(local_addr);
        info!(tls = acceptor.is_some(), "listening on {}", local_addr);
        self.fire_ready(Ok(local_addr));
        Ok((listener, acceptor))
    }

    fn fire_ready(&self, outcome: ServerResult<SocketAddr>) {
        self.ready.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        });
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> ServerResult<()> {
        loop {
            // `accept` is cancel safe: losing the race to shutdown drops no
            // connection.
            let (stream, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    accepted.map_err(|e| ServerError::Accept(Arc::new(e)))?
                }
            };

            self.configure_keep_alive(&stream);

            let incoming = match &acceptor {
                Some(acceptor) => Incoming::Tls {
                    acceptor: acceptor.clone(),
                    stream,
                },
                None => Incoming::Plain(stream),
            };

            let factory = Arc::clone(&self.factory);
            tokio::spawn(session::serve(factory, incoming, remote_addr).in_current_span());
        }
    }

    fn configure_keep_alive(&self, stream: &TcpStream) {
        let period = self.config.tcp_keep_alive;
        if period.is_zero() {
            return;
        }

        let keep_alive = TcpKeepalive::new().with_time(period).with_interval(period);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keep_alive) {
            warn!("could not enable TCP keep-alive: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::TlsSettings;
    use crate::server::error::WorkerError;
    use crate::server::session::{Session, SessionInfo};
    use crate::server::worker::Worker;

    struct IdleWorker;

    impl Worker for IdleWorker {
        async fn run(&mut self, _session: &mut Session) {}
    }

    struct IdleFactory;

    impl WorkerFactory for IdleFactory {
        type Worker = IdleWorker;

        async fn create_worker(&self, _session: &SessionInfo) -> Result<IdleWorker, WorkerError> {
            Ok(IdleWorker)
        }
    }

    #[tokio::test]
    async fn test_startup_failure_reaches_every_signal() {
        let config = ServerConfig::new("127.0.0.1", 0).with_tls(TlsSettings::with_key_pairs(vec![]));
        let server = Server::new(config, IdleFactory);
        let early = server.init_channel();

        let err = server.run().await.unwrap_err();
        assert!(matches!(err, ServerError::NoTlsKeys));

        // Handles taken before and after the failure see the same outcome
        assert!(matches!(early.wait().await, Err(ServerError::NoTlsKeys)));
        assert!(matches!(
            server.init_channel().wait().await,
            Err(ServerError::NoTlsKeys)
        ));
        assert!(server.local_addr().is_none());

        server.close().await;
    }

    #[tokio::test]
    async fn test_fire_ready_only_once() {
        let server = Server::new(ServerConfig::new("127.0.0.1", 0), IdleFactory);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        server.fire_ready(Ok(addr));
        server.fire_ready(Err(ServerError::NotStarted));
        assert_eq!(server.init_channel().wait().await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_ready_after_drop() {
        let server = Server::new(ServerConfig::new("127.0.0.1", 0), IdleFactory);
        let signal = server.init_channel();
        drop(server);
        assert!(matches!(signal.wait().await, Err(ServerError::NotStarted)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_keep_alive_sets_time_and_interval() {
        let period = std::time::Duration::from_secs(30);
        let config = ServerConfig::new("127.0.0.1", 0).with_tcp_keep_alive(period);
        let server = Server::new(config, IdleFactory);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        server.configure_keep_alive(&accepted);

        let socket = SockRef::from(&accepted);
        assert!(socket.keepalive().unwrap());
        assert_eq!(socket.keepalive_time().unwrap(), period);
        assert_eq!(socket.keepalive_interval().unwrap(), period);
    }
}
