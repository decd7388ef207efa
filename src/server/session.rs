use std::error::Error;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bson::{Bson, Document, RawBson, RawDocumentBuf};
use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{Instrument, field, info, info_span, warn};

use crate::document::{DocumentError, WireDocument};
use crate::error_doc::MongoError;
use crate::protocol::{Message, MongoCodec, build_reply};
use crate::server::error::SessionError;
use crate::server::handshake::{Incoming, Transport, handshake};
use crate::server::worker::{Worker, WorkerFactory};

/// What a worker factory gets to know about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub remote_addr: SocketAddr,
    /// SNI name sent during the TLS handshake, without a trailing dot.
    pub server_name: Option<String>,
}

/// A single client connection.
///
/// Owns the framed transport for its whole lifetime. Requests are read with
/// [`read_message`](Self::read_message); replies go through the respond
/// methods, which pick the reply format from the request's opcode.
pub struct Session {
    framed: Framed<Box<dyn Transport>, MongoCodec>,
    info: SessionInfo,
}

impl Session {
    /// Wraps an already negotiated stream.
    pub fn from_stream<S>(stream: S, info: SessionInfo) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(Box::new(stream), info)
    }

    fn new(transport: Box<dyn Transport>, info: SessionInfo) -> Self {
        Self {
            framed: Framed::new(transport, MongoCodec::new()),
            info,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    pub fn server_name(&self) -> Option<&str> {
        self.info.server_name.as_deref()
    }

    /// Reads the next request.
    ///
    /// Returns `Ok(None)` once the client has closed the connection.
    pub async fn read_message(&mut self) -> Result<Option<Message>, SessionError> {
        Ok(self.framed.next().await.transpose()?)
    }

    /// Writes one complete frame.
    pub async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Replies to `request` with a document built from alternating names and
    /// values.
    ///
    /// Every pair is kept in order, repeated names included. `ok: 1` is
    /// appended unless one of the names is `"ok"`. An odd number of arguments
    /// or a non-string name fails before anything is written.
    pub async fn respond_to_command_make_bson(
        &mut self,
        request: &Message,
        args: &[Bson],
    ) -> Result<(), SessionError> {
        let doc = make_document(args)?;
        let doc = WireDocument::from_bytes(Bytes::from(doc.into_bytes()))?;
        self.respond_to_command(request, doc).await
    }

    /// Replies to `request` with `doc`.
    ///
    /// Legacy write opcodes are unacknowledged: nothing is written and the
    /// call succeeds.
    pub async fn respond_to_command(
        &mut self,
        request: &Message,
        doc: WireDocument,
    ) -> Result<(), SessionError> {
        match build_reply(request.header(), doc)? {
            Some(reply) => self.send_message(reply).await,
            None => Ok(()),
        }
    }

    /// Replies to `request` with the document form of `error`.
    ///
    /// `None` replies `{ok: 1}`. A [`MongoError`] supplies its own document;
    /// any other error becomes `{ok: 0, errmsg: <message>}`.
    pub async fn respond_with_error(
        &mut self,
        request: &Message,
        error: Option<&(dyn Error + Send + Sync + 'static)>,
    ) -> Result<(), SessionError> {
        info!("respond with error: {:?}", error);
        let doc = error_document(error);
        self.respond_to_command(request, WireDocument::from_document(&doc)?)
            .await
    }

    async fn shutdown(mut self) {
        let transport = self.framed.get_mut();
        if let Err(e) = transport.shutdown().await {
            tracing::debug!("shutdown failed: {}", e);
        }
    }
}

fn make_document(args: &[Bson]) -> Result<RawDocumentBuf, SessionError> {
    if args.len() % 2 != 0 {
        return Err(SessionError::OddArgumentCount(args.len()));
    }

    let mut doc = RawDocumentBuf::new();
    let mut has_ok = false;
    for (i, pair) in args.chunks_exact(2).enumerate() {
        let Bson::String(name) = &pair[0] else {
            return Err(SessionError::NonStringKey {
                index: i * 2,
                found: pair[0].to_string(),
            });
        };
        let value = RawBson::try_from(pair[1].clone()).map_err(DocumentError::from)?;
        doc.append(name, value);
        has_ok |= name == "ok";
    }

    if !has_ok {
        doc.append("ok", 1i32);
    }
    Ok(doc)
}

fn error_document(error: Option<&(dyn Error + Send + Sync + 'static)>) -> Document {
    match error {
        None => bson::doc! { "ok": 1i32 },
        Some(e) => match e.downcast_ref::<MongoError>() {
            Some(mongo) => mongo.to_document(),
            None => bson::doc! { "ok": 0i32, "errmsg": e.to_string() },
        },
    }
}

/// Runs one accepted connection to completion.
///
/// Every exit path closes the transport. Handshake and worker creation
/// failures are logged and end the session.
pub(crate) async fn serve<F, S>(factory: Arc<F>, incoming: Incoming<S>, remote_addr: SocketAddr)
where
    F: WorkerFactory,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = info_span!("session", remote = %remote_addr, sni = field::Empty);
    async move {
        info!("new connection");

        let (transport, server_name) = match handshake(incoming).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!("handshake failed: {}", e);
                return;
            }
        };
        if let Some(name) = &server_name {
            tracing::Span::current().record("sni", name.as_str());
        }

        let info = SessionInfo {
            remote_addr,
            server_name,
        };
        let mut session = Session::new(transport, info);

        match factory.create_worker(session.info()).await {
            Ok(mut worker) => {
                let run = AssertUnwindSafe(worker.run(&mut session)).catch_unwind();
                if run.await.is_err() {
                    warn!("worker panicked");
                }
                worker.close().await;
            }
            Err(e) => warn!("could not create worker: {}", e),
        }

        session.shutdown().await;
        info!("socket closed");
    }
    .instrument(span)
    .await
}
