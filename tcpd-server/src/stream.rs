//! Stream abstraction for TLS and plain connections.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    /// A connection handed to a handler: either the raw accepted stream or
    /// the same stream wrapped in a server-side TLS session.
    #[project = MaybeStreamProj]
    pub enum MaybeTlsStream<IO> {
        Plain { #[pin] stream: IO },
        Tls { #[pin] stream: ServerTlsStream<IO> },
    }
}

impl<IO> MaybeTlsStream<IO> {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls { .. })
    }

    /// Returns the underlying transport.
    pub fn get_ref(&self) -> &IO {
        match self {
            MaybeTlsStream::Plain { stream } => stream,
            MaybeTlsStream::Tls { stream } => stream.get_ref().0,
        }
    }

    /// Returns the SNI server name sent by the client, if any.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            MaybeTlsStream::Plain { .. } => None,
            MaybeTlsStream::Tls { stream } => stream.get_ref().1.server_name(),
        }
    }
}

impl<IO> AsyncRead for MaybeTlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            MaybeStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for MaybeTlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            MaybeStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_flush(cx),
            MaybeStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            MaybeStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
