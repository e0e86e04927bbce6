//! TCP server: configuration, statistics, and the accept loop.

use crate::error::ServerError;
use crate::handler::Handler;
use crate::listener::{self, Listener};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::worker::Worker;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

/// Pause after a transient accept error before accepting again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Where per-connection diagnostics go (handshake failures, handler
    /// errors and panics, forced closes). Discarded when `None`.
    pub error_log: Option<Dispatch>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("error_log", &self.error_log.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7400)))
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            tls_acceptor: None,
            error_log: None,
            metrics: None,
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sends per-connection diagnostics to `dispatch`.
    pub fn with_error_log(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.error_log = Some(dispatch.into());
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub accept_retries: AtomicU64,
    pub tls_handshake_failures: AtomicU64,
    pub handler_errors: AtomicU64,
    pub handler_panics: AtomicU64,
    pub forced_closes: AtomicU64,
}

/// Concurrent TCP connection server.
///
/// Share it as `Arc<Server<H>>`: one task drives [`serve`](Self::serve) or
/// [`listen_and_serve`](Self::listen_and_serve) while others may call
/// [`close`](Self::close) or [`shutdown`](Self::shutdown).
pub struct Server<H> {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<H>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) stats: Arc<ServerStats>,
    /// Set once by the first close or shutdown.
    pub(crate) closing: AtomicBool,
    /// Fires when the acceptor must stop and release its listener.
    pub(crate) stop_accepting: CancellationToken,
    running: AtomicBool,
    /// Woken when the accept loop exits; no registration follows it.
    pub(crate) accept_stopped: Notify,
}

impl<H> Server<H> {
    /// Creates a new server dispatching connections to `handler`.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            registry: Arc::new(Registry::new()),
            stats: Arc::new(ServerStats::default()),
            closing: AtomicBool::new(false),
            stop_accepting: CancellationToken::new(),
            running: AtomicBool::new(false),
            accept_stopped: Notify::new(),
        }
    }

    /// Binds the configured address and serves it until close or shutdown.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError>
    where
        H: Handler<tokio::net::TcpStream>,
    {
        let listener = listener::bind_tcp(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener`, spawning a worker for each.
    ///
    /// Returns `Ok(())` once [`close`](Self::close) or
    /// [`shutdown`](Self::shutdown) has been called, even if it was blocked
    /// in accept at the time. Returns `Err(ServerError::Accept)` on an accept
    /// error that is neither transient nor caused by closing.
    pub async fn serve<L>(&self, mut listener: L) -> Result<(), ServerError>
    where
        L: Listener,
        H: Handler<L::Io>,
    {
        let local = match listener.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown>".to_string(),
        };
        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("Server listening on {} ({})", local, tls_mode);
        self.running.store(true, Ordering::SeqCst);

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop_accepting.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((io, peer)) => self.spawn_worker(io, peer.to_string()),
                Err(_) if self.is_closing() => break Ok(()),
                Err(e) if listener::is_transient(&e) => {
                    tracing::warn!(
                        "Accept error: {}; retrying in {:?}",
                        e,
                        ACCEPT_RETRY_DELAY
                    );
                    self.stats.accept_retries.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = self.config.metrics {
                        metrics
                            .accept_errors_total
                            .with_label_values(&["transient"])
                            .inc();
                    }
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    if let Some(ref metrics) = self.config.metrics {
                        metrics.accept_errors_total.with_label_values(&["fatal"]).inc();
                    }
                    break Err(ServerError::Accept(e));
                }
            }
        };

        drop(listener);
        self.running.store(false, Ordering::SeqCst);
        self.accept_stopped.notify_waiters();
        tracing::info!("Server stopped accepting on {}", local);
        result
    }

    fn spawn_worker<IO>(&self, io: IO, peer: String)
    where
        H: Handler<IO>,
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let registration = self.registry.register(peer.clone());
        tracing::debug!("Accepted {} as connection {}", peer, registration.id());

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let dispatch = self.dispatch();
        let worker = Worker {
            handler: self.handler.clone(),
            tls_acceptor: self.config.tls_acceptor.clone(),
            stats: self.stats.clone(),
            metrics: self.config.metrics.clone(),
            dispatch: dispatch.clone(),
        };
        tokio::spawn(worker.run(io, peer, registration).with_subscriber(dispatch));
    }

    fn dispatch(&self) -> Dispatch {
        match self.config.error_log {
            Some(ref dispatch) => dispatch.clone(),
            None => Dispatch::none(),
        }
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns whether close or shutdown has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns the live connection registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Echo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_config_debug_hides_internals() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let debug = format!("{:?}", config);
        assert!(debug.contains("tls_enabled: false"));
        assert!(debug.contains("metrics_enabled: false"));
        assert!(!config.tls_enabled());
    }

    #[test]
    fn test_server_initial_state() {
        let server = Server::new(ServerConfig::default(), Echo::new());
        assert!(!server.is_running());
        assert!(!server.is_closing());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.config().bind_addr.port(), 7400);
    }

    #[tokio::test]
    async fn test_serve_echo_and_count() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_metrics(metrics.clone());
        let server = Arc::new(Server::new(config, Echo::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serve = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"round trip").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"round trip");
        assert!(server.is_running());
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);

        drop(client);
        server.shutdown(Duration::from_secs(1)).await.unwrap();
        serve.await.unwrap().unwrap();
        assert!(!server.is_running());
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 0);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("tcpd_connections_total 1"));
        assert!(encoded.contains("tcpd_connections_active 0"));
    }

    #[tokio::test]
    async fn test_serve_after_close_returns_immediately() {
        let server = Server::new(ServerConfig::default(), Echo::new());
        server.close();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), server.serve(listener))
            .await
            .expect("serve should not block after close");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listen_and_serve_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig::new(taken.local_addr().unwrap());
        let server = Server::new(config, Echo::new());

        match server.listen_and_serve().await {
            Err(ServerError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
            other => panic!("expected bind error, got {:?}", other),
        }
    }
}
