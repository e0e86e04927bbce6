//! Immediate close and deadline-bound graceful shutdown.
//!
//! Both start the same way: stop the acceptor (which drops the listener) and
//! send the close signal to every registered connection. `close` then tears
//! every connection down without waiting; `shutdown` waits for the registry
//! to drain and only tears down what is left when its deadline fires.

use crate::error::ServerError;
use crate::server::Server;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;

impl<H> Server<H> {
    /// Stops accepting and signals every connection. Returns `true` for the
    /// first caller only; later callers still re-signal.
    fn begin_close(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::SeqCst);
        self.stop_accepting.cancel();
        let signalled = self.registry.cancel_all();
        if first {
            tracing::info!(
                "Server closing, signalled {} connection(s)",
                signalled
            );
        }
        first
    }

    /// Closes the server immediately.
    ///
    /// Stops the accept loop, signals every connection, and force-closes
    /// every registered connection without waiting for its worker to finish.
    /// Safe to call more than once and concurrently with [`shutdown`](Self::shutdown).
    ///
    /// There is no error to report: the listener is released by dropping it
    /// when the accept loop exits, and dropping a tokio listener cannot fail.
    /// Connections the accept loop registers after this call start out
    /// force-closed.
    pub fn close(&self) {
        self.begin_close();
        let forced = self.registry.force_close_all();
        if forced > 0 {
            tracing::info!("Force-closed {} connection(s)", forced);
        }
    }

    /// Shuts the server down gracefully, waiting at most `timeout`.
    ///
    /// See [`shutdown_until`](Self::shutdown_until).
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        self.shutdown_until(tokio::time::sleep(timeout)).await
    }

    /// Shuts the server down gracefully, waiting until `deadline` completes.
    ///
    /// Stops the accept loop and signals every connection, then waits for
    /// the accept loop to exit and for all connections to finish. Returns
    /// `Ok(())` once the registry is empty and nothing can register again.
    /// If `deadline` completes first, force-closes whatever is still
    /// registered and returns [`ServerError::DeadlineExceeded`]. With no
    /// accept loop running and an empty registry, an already-expired
    /// deadline still returns `Ok(())`.
    pub async fn shutdown_until<F>(&self, deadline: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        self.begin_close();

        tokio::select! {
            biased;
            _ = async {
                self.wait_accept_stopped().await;
                self.registry.wait_empty().await
            } => {
                tracing::info!("All connections drained");
                Ok(())
            }
            _ = deadline => {
                let remaining = self.registry.force_close_all();
                tracing::warn!(
                    "Shutdown deadline exceeded, force-closed {} connection(s)",
                    remaining
                );
                Err(ServerError::DeadlineExceeded { remaining })
            }
        }
    }

    /// Completes once `serve` is not running. A connection accepted just
    /// before the stop token fired is registered by then.
    async fn wait_accept_stopped(&self) {
        loop {
            let stopped = self.accept_stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if !self.is_running() {
                return;
            }
            stopped.await;
        }
    }
}
