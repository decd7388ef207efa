use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: usize = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Byte stream a session runs on, plain or TLS.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// An accepted socket before the session has started.
pub enum Incoming<S> {
    Plain(S),
    Tls { acceptor: TlsAcceptor, stream: S },
}

/// Completes the transport handshake.
///
/// Returns the transport the session reads from and the SNI name the client
/// sent, if any. Plain sockets have nothing to negotiate.
///
/// rustls lowercases the name it reports, so the first record is read ahead
/// and the name is taken from the raw ClientHello as the client spelled it.
pub async fn handshake<S>(incoming: Incoming<S>) -> io::Result<(Box<dyn Transport>, Option<String>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match incoming {
        Incoming::Plain(stream) => Ok((Box::new(stream), None)),
        Incoming::Tls { acceptor, mut stream } => {
            let record = read_record(&mut stream).await?;
            let sent = client_hello_server_name(&record);

            let tls = acceptor.accept(Replay::new(record, stream)).await?;
            let server_name = tls.get_ref().1.server_name().map(|accepted| {
                match sent {
                    Some(sent) if same_name(&sent, accepted) => normalize_server_name(&sent),
                    _ => normalize_server_name(accepted),
                }
            });
            Ok((Box::new(tls), server_name))
        }
    }
}

/// Strips the trailing root dot from a fully qualified name.
pub fn normalize_server_name(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}

fn same_name(sent: &str, accepted: &str) -> bool {
    let sent = sent.strip_suffix('.').unwrap_or(sent);
    let accepted = accepted.strip_suffix('.').unwrap_or(accepted);
    sent.eq_ignore_ascii_case(accepted)
}

/// Reads one whole TLS record, header included.
async fn read_record<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut record = vec![0u8; RECORD_HEADER_LEN];
    stream.read_exact(&mut record).await?;
    let len = usize::from(u16::from_be_bytes([record[3], record[4]]));
    record.resize(RECORD_HEADER_LEN + len, 0);
    stream.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;
    Ok(record)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    let (head, tail) = buf.split_at_checked(n)?;
    *buf = tail;
    Some(head)
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    take(buf, 1).map(|b| b[0])
}

fn take_u16(buf: &mut &[u8]) -> Option<usize> {
    take(buf, 2).map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
}

fn take_u24(buf: &mut &[u8]) -> Option<usize> {
    take(buf, 3).map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
}

/// Skips a vector whose length prefix is `prefix` bytes wide.
fn skip_vec(buf: &mut &[u8], prefix: usize) -> Option<()> {
    let len = match prefix {
        1 => usize::from(take_u8(buf)?),
        _ => take_u16(buf)?,
    };
    take(buf, len).map(|_| ())
}

/// The host name in the server_name extension of a ClientHello record.
///
/// Returns `None` for anything else, including a ClientHello split across
/// records.
pub fn client_hello_server_name(record: &[u8]) -> Option<String> {
    let mut buf = record;
    if take_u8(&mut buf)? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    take(&mut buf, 2)?;
    let len = take_u16(&mut buf)?;
    let mut fragment = take(&mut buf, len)?;

    if take_u8(&mut fragment)? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = take_u24(&mut fragment)?;
    let mut hello = take(&mut fragment, len)?;

    // legacy_version and random
    take(&mut hello, 2 + 32)?;
    skip_vec(&mut hello, 1)?; // session id
    skip_vec(&mut hello, 2)?; // cipher suites
    skip_vec(&mut hello, 1)?; // compression methods

    let len = take_u16(&mut hello)?;
    let mut extensions = take(&mut hello, len)?;
    while !extensions.is_empty() {
        let kind = take_u16(&mut extensions)?;
        let len = take_u16(&mut extensions)?;
        let mut data = take(&mut extensions, len)?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }

        let len = take_u16(&mut data)?;
        let mut names = take(&mut data, len)?;
        while !names.is_empty() {
            let name_type = take_u8(&mut names)?;
            let len = take_u16(&mut names)?;
            let name = take(&mut names, len)?;
            if name_type == NAME_TYPE_HOST_NAME {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
        return None;
    }
    None
}

/// A stream that yields `prefix` before reading from `inner`.
struct Replay<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Replay<S> {
    fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, RootCertStore};
    use tokio::io::AsyncWriteExt;

    /// The first record a rustls client sends for `name`.
    fn client_hello(name: &str) -> Vec<u8> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
        let name = ServerName::try_from(name.to_string()).unwrap();
        let mut conn = ClientConnection::new(Arc::new(config), name).unwrap();

        let mut out = Vec::new();
        conn.write_tls(&mut out).unwrap();
        let len = usize::from(u16::from_be_bytes([out[3], out[4]]));
        out.truncate(RECORD_HEADER_LEN + len);
        out
    }

    #[test]
    fn test_normalize_server_name() {
        assert_eq!(normalize_server_name("Foo.Example.com."), "Foo.Example.com");
        assert_eq!(normalize_server_name("localhost"), "localhost");
        assert_eq!(normalize_server_name(""), "");
    }

    #[test]
    fn test_client_hello_keeps_case() {
        let record = client_hello("Foo.Example.com");
        assert_eq!(
            client_hello_server_name(&record).as_deref(),
            Some("Foo.Example.com")
        );
    }

    #[test]
    fn test_client_hello_without_name() {
        // IP addresses are never sent as SNI
        let record = client_hello("127.0.0.1");
        assert_eq!(client_hello_server_name(&record), None);
    }

    #[test]
    fn test_truncated_client_hello() {
        let record = client_hello("localhost");
        for len in [0, 3, RECORD_HEADER_LEN, 40, record.len() - 1] {
            assert_eq!(client_hello_server_name(&record[..len]), None, "len {}", len);
        }
        assert_eq!(client_hello_server_name(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_same_name() {
        assert!(same_name("Foo.Example.com.", "foo.example.com"));
        assert!(!same_name("foo.example.org", "foo.example.com"));
    }

    #[tokio::test]
    async fn test_replay_yields_prefix_first() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut replay = Replay::new(b"hello ".to_vec(), server);

        client.write_all(b"world").await.unwrap();
        drop(client);

        let mut out = String::new();
        replay.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_plain_passthrough() {
        let (client, server) = tokio::io::duplex(64);
        let (mut transport, server_name) = handshake(Incoming::Plain(server)).await.unwrap();
        assert_eq!(server_name, None);

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
