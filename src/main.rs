use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use clap::Parser;
use mongowire::error_doc::MongoError;
use mongowire::logging;
use mongowire::protocol::{DEFAULT_MAX_MESSAGE_SIZE, Message};
use mongowire::server::{
    LogConfig, LogFormat, Server, ServerConfig, Session, SessionError, SessionInfo, TlsKeyPair,
    TlsSettings, TlsVersion, Worker, WorkerError, WorkerFactory,
};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "mongowire", version)]
#[command(about = "MongoDB wire protocol server answering handshake commands")]
struct Cli {
    /// Host or address to listen on
    #[arg(long, default_value = "127.0.0.1", env = "MONGOWIRE_HOST")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 27017, env = "MONGOWIRE_PORT")]
    port: u16,

    /// Require TLS even when no certificate is given
    #[arg(long)]
    tls: bool,

    /// PEM certificate chain; pairs with the --tls-key at the same position
    #[arg(long = "tls-cert", value_name = "PEM")]
    tls_certs: Vec<PathBuf>,

    /// PEM private key
    #[arg(long = "tls-key", value_name = "PEM")]
    tls_keys: Vec<PathBuf>,

    /// Lowest accepted TLS version (1.2 or 1.3)
    #[arg(long)]
    tls_min_version: Option<TlsVersion>,

    /// TCP keep-alive period in seconds, 0 disables it
    #[arg(long, default_value_t = 0)]
    keep_alive_secs: u64,

    /// Log level or filter directive
    #[arg(long, default_value = "info", env = "MONGOWIRE_LOG")]
    log_level: String,

    /// Log to stdout as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, String> {
        if self.tls_certs.len() != self.tls_keys.len() {
            return Err(format!(
                "{} --tls-cert but {} --tls-key given",
                self.tls_certs.len(),
                self.tls_keys.len()
            ));
        }

        let key_pairs: Vec<_> = self
            .tls_certs
            .into_iter()
            .zip(self.tls_keys)
            .map(|(cert, key)| TlsKeyPair::new(cert, key))
            .collect();
        let tls = TlsSettings {
            enabled: self.tls || !key_pairs.is_empty(),
            key_pairs,
            min_version: self.tls_min_version,
        };

        let logging = LogConfig {
            level: self.log_level,
            format: if self.log_json {
                LogFormat::Json
            } else {
                LogFormat::Text
            },
            stdout: true,
            file: self.log_file,
        };

        Ok(ServerConfig::new(self.host, self.port)
            .with_tls(tls)
            .with_tcp_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .with_logging(logging))
    }
}

/// Answers the commands drivers send while connecting.
struct PingWorker;

impl PingWorker {
    async fn handle(&self, session: &mut Session, request: &Message) -> Result<(), SessionError> {
        let Some(command) = command_document(request)? else {
            // Writes get no reply; other requests get a bare success
            return session.respond_with_error(request, None).await;
        };
        let Some(name) = command.keys().next().cloned() else {
            let err = MongoError::new(mongowire::error_doc::codes::BAD_VALUE, "empty command");
            return session.respond_with_error(request, Some(&err)).await;
        };

        debug!(command = %name, "handling command");
        match name.as_str() {
            "ping" => session.respond_to_command_make_bson(request, &[]).await,
            "hello" | "isMaster" | "ismaster" => {
                let primary_key = if name == "hello" {
                    "isWritablePrimary"
                } else {
                    "ismaster"
                };
                let max_message_size = i32::try_from(DEFAULT_MAX_MESSAGE_SIZE).unwrap_or(i32::MAX);
                session
                    .respond_to_command_make_bson(
                        request,
                        &[
                            Bson::from(primary_key),
                            Bson::from(true),
                            Bson::from("maxBsonObjectSize"),
                            Bson::from(16 * 1024 * 1024),
                            Bson::from("maxMessageSizeBytes"),
                            Bson::from(max_message_size),
                            Bson::from("maxWriteBatchSize"),
                            Bson::from(100_000),
                            Bson::from("localTime"),
                            Bson::from(bson::DateTime::now()),
                            Bson::from("minWireVersion"),
                            Bson::from(0),
                            Bson::from("maxWireVersion"),
                            Bson::from(13),
                        ],
                    )
                    .await
            }
            "buildInfo" | "buildinfo" => {
                session
                    .respond_to_command_make_bson(
                        request,
                        &[
                            Bson::from("version"),
                            Bson::from(env!("CARGO_PKG_VERSION")),
                        ],
                    )
                    .await
            }
            _ => {
                let err = MongoError::command_not_found(&name);
                session.respond_with_error(request, Some(&err)).await
            }
        }
    }
}

/// The command document of a request, if it carries one.
fn command_document(request: &Message) -> Result<Option<Document>, SessionError> {
    let doc = match request {
        Message::Msg(msg) => msg.body(),
        Message::Query(query) if query.is_command() => Some(&query.query),
        Message::Command(command) => Some(&command.command_args),
        _ => None,
    };
    Ok(doc.map(|doc| doc.to_document()).transpose()?)
}

impl Worker for PingWorker {
    async fn run(&mut self, session: &mut Session) {
        loop {
            let request = match session.read_message().await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    warn!("read failed: {}", e);
                    return;
                }
            };

            match self.handle(session, &request).await {
                Ok(()) => {}
                Err(SessionError::UnsupportedOpcode(e)) => debug!("{}", e),
                Err(e) => {
                    warn!("reply failed: {}", e);
                    return;
                }
            }
        }
    }
}

struct PingFactory;

impl WorkerFactory for PingFactory {
    type Worker = PingWorker;

    async fn create_worker(&self, _session: &SessionInfo) -> Result<PingWorker, WorkerError> {
        Ok(PingWorker)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    logging::init(&config.logging)?;
    info!("mongowire v{}", env!("CARGO_PKG_VERSION"));

    let server = Arc::new(Server::new(config, PingFactory));
    let ready = server.init_channel();
    let mut runner = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let addr = ready.wait().await?;
    info!("accepting connections on {}", addr);

    tokio::select! {
        result = &mut runner => result??,
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.close().await;
            runner.await??;
        }
    }
    Ok(())
}
