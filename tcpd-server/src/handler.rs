//! Handler capability: the per-connection protocol logic the server dispatches to.

use crate::stream::MaybeTlsStream;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Protocol logic run once per accepted connection.
///
/// The handler owns the connection for the duration of the call. It should
/// return when its work is done or soon after `close` fires; once it returns
/// the connection is dropped and the socket closed. A handler that ignores
/// `close` keeps running until the server force-closes the connection.
///
/// Force-close aborts the handler's task, which only takes effect at an
/// `.await` point. A handler that blocks its thread synchronously keeps the
/// socket open until it yields.
///
/// A panic inside `serve` is contained to its connection and reported to the
/// server's error log, but the process-wide panic hook still runs first; the
/// default hook prints the panic to stderr. Install a hook with
/// [`std::panic::set_hook`] to route or silence that output.
pub trait Handler<IO>: Send + Sync + 'static {
    fn serve(
        &self,
        conn: MaybeTlsStream<IO>,
        close: CloseSignal,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Receive-only notification that the server wants this connection to wind down.
///
/// Every clone observes the signal, and a signal sent before anyone waits
/// is not lost.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    token: CancellationToken,
}

impl CloseSignal {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Completes once the server has asked the connection to close.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Returns whether close has been requested.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Adapts an async closure into a [`Handler`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Creates a [`Handler`] from an async closure.
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

impl<F, Fut, IO> Handler<IO> for HandlerFn<F>
where
    F: Fn(MaybeTlsStream<IO>, CloseSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn serve(
        &self,
        conn: MaybeTlsStream<IO>,
        close: CloseSignal,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (self.f)(conn, close)
    }
}

/// Echoes every byte back to the peer until EOF or close.
#[derive(Debug, Clone)]
pub struct Echo {
    buffer_size: usize,
}

impl Default for Echo {
    fn default() -> Self {
        Self { buffer_size: 8192 }
    }
}

impl Echo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}

impl<IO> Handler<IO> for Echo
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn serve(
        &self,
        mut conn: MaybeTlsStream<IO>,
        close: CloseSignal,
    ) -> Result<(), HandlerError> {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                _ = close.closed() => {
                    tracing::debug!("Close requested, ending echo");
                    conn.shutdown().await.ok();
                    return Ok(());
                }
                result = conn.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        tracing::debug!("Peer closed connection");
                        return Ok(());
                    }
                    conn.write_all(&buf[..n]).await?;
                }
            }
        }
    }
}
