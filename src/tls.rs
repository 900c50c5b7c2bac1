// ABOUTME: TLS-upgradeable transport for Connection - plain until IDENTIFY negotiates tls_v1
// ABOUTME: MaybeTlsStream is Unpin in both variants so it can live behind tokio::io::split directly

use crate::error::{NsqError, NsqResult};
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// A duplex stream that starts out plain and may be upgraded to TLS in place.
///
/// `Connection` never holds a bare `TcpStream`; it always goes through this
/// enum so the read/write halves produced by `tokio::io::split` keep working
/// across an in-flight TLS upgrade without Connection needing to know which
/// variant it currently has.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    fn into_plain(self) -> NsqResult<TcpStream> {
        match self {
            MaybeTlsStream::Plain(stream) => Ok(stream),
            MaybeTlsStream::Tls(_) => Err(NsqError::Upgrade(
                "connection is already upgraded to TLS".into(),
            )),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

fn default_root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

async fn wrap_tls(stream: TcpStream, domain: &str) -> NsqResult<MaybeTlsStream> {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(default_root_store())
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|_| NsqError::Upgrade(format!("invalid server name '{domain}'")))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| NsqError::Upgrade(e.to_string()))?;

    Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
}

/// Recombine a previously split plain stream, upgrade it to TLS, and
/// re-split the result.
///
/// This is the handback half of the upgrade protocol described in §4.2.4:
/// the caller is responsible for first stopping whatever task owns
/// `read_half` and recovering it (rather than aborting it, which would drop
/// the half and the bytes already buffered in the kernel socket along with
/// it). Once both halves are back in hand, `unsplit` recovers the original
/// `MaybeTlsStream`, which must still be the `Plain` variant.
pub async fn upgrade_duplex(
    read_half: ReadHalf<MaybeTlsStream>,
    write_half: WriteHalf<MaybeTlsStream>,
    domain: &str,
) -> NsqResult<(ReadHalf<MaybeTlsStream>, WriteHalf<MaybeTlsStream>)> {
    let stream = read_half.unsplit(write_half);
    let plain = stream.into_plain()?;
    let wrapped = wrap_tls(plain, domain).await?;
    Ok(io::split(wrapped))
}
