//! Connection worker: runs one accepted connection from handshake to cleanup.
//!
//! The TLS handshake and the handler run in their own task so that a panic
//! or a force-close stays local to this connection. The worker watches that
//! task and the connection's force-close token; whichever finishes first, the
//! worker records the outcome and drops its [`Registration`], which removes
//! the connection from the registry.

use crate::error::ServerError;
use crate::handler::{CloseSignal, Handler};
use crate::metrics::Metrics;
use crate::registry::Registration;
use crate::server::ServerStats;
use crate::tls;
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tokio_rustls::TlsAcceptor;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};

/// How a connection ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Handler returned `Ok`.
    Completed,
    /// TLS handshake failed; the handler was never called.
    HandshakeFailed(ServerError),
    /// Handler returned an error.
    Failed(ServerError),
    /// Handler panicked. The panic hook has already run by the time the
    /// worker sees this.
    Panicked(String),
    /// Server tore the connection down.
    ForceClosed,
}

/// Everything a worker needs from the server, cloned per connection.
pub(crate) struct Worker<H> {
    pub(crate) handler: Arc<H>,
    pub(crate) tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) metrics: Option<Arc<Metrics>>,
    /// Diagnostic sink for the inner task; the caller runs `run` under it too.
    pub(crate) dispatch: Dispatch,
}

impl<H> Worker<H> {
    /// Serves `io` until the handler finishes or the connection is force-closed.
    pub(crate) async fn run<IO>(self, io: IO, peer: String, registration: Registration)
    where
        H: Handler<IO>,
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let span = tracing::info_span!("conn", id = %registration.id(), peer = %peer);
        let kill = registration.kill_token();

        let mut task = tokio::spawn(
            Self::serve(
                self.handler.clone(),
                self.tls_acceptor.clone(),
                io,
                peer.clone(),
                registration.close_signal(),
            )
            .instrument(span.clone())
            .with_subscriber(self.dispatch.clone()),
        );

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = kill.cancelled() => {
                task.abort();
                // Resolves once the handler future, and the stream it owns, are dropped.
                (&mut task).await
            }
        };

        let outcome = match joined {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(e @ ServerError::TlsHandshake(_))) => Outcome::HandshakeFailed(e),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(e) => Self::join_outcome(e),
        };

        span.in_scope(|| self.record(&outcome, &peer, started));
        drop(registration);
    }

    async fn serve<IO>(
        handler: Arc<H>,
        acceptor: Option<Arc<TlsAcceptor>>,
        io: IO,
        peer: String,
        close: CloseSignal,
    ) -> Result<(), ServerError>
    where
        H: Handler<IO>,
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream = tls::maybe_accept(io, acceptor.as_deref(), &peer).await?;
        let tls_status = if stream.is_tls() { " (TLS)" } else { "" };
        tracing::debug!("Client connected: {}{}", peer, tls_status);

        handler
            .serve(stream, close)
            .await
            .map_err(ServerError::Handler)
    }

    fn join_outcome(err: JoinError) -> Outcome {
        if err.is_panic() {
            Outcome::Panicked(panic_message(err.into_panic()))
        } else {
            Outcome::ForceClosed
        }
    }

    fn record(&self, outcome: &Outcome, peer: &str, started: Instant) {
        match outcome {
            Outcome::Completed => {
                tracing::debug!("Client disconnected: {}", peer);
            }
            Outcome::HandshakeFailed(e) => {
                tracing::warn!("[{}] {}", peer, e);
                self.stats.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.tls_handshake_failures_total.inc();
                }
            }
            Outcome::Failed(e) => {
                tracing::warn!("[{}] {}", peer, e);
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.handler_failures_total.with_label_values(&["error"]).inc();
                }
            }
            Outcome::Panicked(msg) => {
                tracing::error!("[{}] Handler panicked: {}", peer, msg);
                self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.handler_failures_total.with_label_values(&["panic"]).inc();
                }
            }
            Outcome::ForceClosed => {
                tracing::debug!("[{}] Connection force-closed", peer);
                self.stats.forced_closes.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.forced_closes_total.inc();
                }
            }
        }

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
            metrics
                .connection_duration
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
