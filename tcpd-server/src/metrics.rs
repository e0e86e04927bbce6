//! Prometheus metrics for the connection server.
//!
//! This module provides:
//! - Metrics registry with connection lifecycle counters, gauges, and a histogram
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use crate::listener::{self, Listener};
use crate::server::ACCEPT_RETRY_DELAY;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Connection lifetime histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0];

/// Prometheus metrics for the server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently registered connections.
    pub connections_active: Gauge,
    /// TLS handshakes that failed before the handler ran.
    pub tls_handshake_failures_total: Counter,
    /// Handler failures by kind (`error` or `panic`).
    pub handler_failures_total: CounterVec,
    /// Connections torn down by close or an expired shutdown deadline.
    pub forced_closes_total: Counter,
    /// Accept errors by kind (`transient` or `fatal`).
    pub accept_errors_total: CounterVec,
    /// Time from accept to worker cleanup.
    pub connection_duration: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "tcpd_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "tcpd_connections_active",
            "Number of currently registered connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let tls_handshake_failures_total = Counter::with_opts(Opts::new(
            "tcpd_tls_handshake_failures_total",
            "Total number of failed TLS handshakes",
        ))?;
        registry.register(Box::new(tls_handshake_failures_total.clone()))?;

        let handler_failures_total = CounterVec::new(
            Opts::new(
                "tcpd_handler_failures_total",
                "Total handler failures by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(handler_failures_total.clone()))?;

        let forced_closes_total = Counter::with_opts(Opts::new(
            "tcpd_forced_closes_total",
            "Total connections force-closed by the server",
        ))?;
        registry.register(Box::new(forced_closes_total.clone()))?;

        let accept_errors_total = CounterVec::new(
            Opts::new("tcpd_accept_errors_total", "Total accept errors by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(accept_errors_total.clone()))?;

        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tcpd_connection_duration_seconds",
                "Connection lifetime in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            tls_handshake_failures_total,
            handler_failures_total,
            forced_closes_total,
            accept_errors_total,
            connection_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

/// Runs the HTTP metrics server until `shutdown` fires.
///
/// Serves metrics at `/metrics` and a liveness probe at `/health`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    serve_metrics(listener, metrics, shutdown).await
}

/// Serves the metrics endpoint on an already-bound listener.
///
/// Transient accept errors are retried after [`ACCEPT_RETRY_DELAY`]; any
/// other accept error stops the endpoint.
pub async fn serve_metrics<L: Listener>(
    mut listener: L,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) if listener::is_transient(&e) => {
                        tracing::warn!(
                            "Metrics server accept error: {}; retrying in {:?}",
                            e,
                            ACCEPT_RETRY_DELAY
                        );
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                        return Err(e.into());
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(metrics.encode()))),
        "/health" | "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.tls_handshake_failures_total.inc();
        metrics.handler_failures_total.with_label_values(&["panic"]).inc();
        metrics.accept_errors_total.with_label_values(&["transient"]).inc();
        metrics.forced_closes_total.inc_by(3.0);
        metrics.connection_duration.observe(0.25);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("tcpd_connections_total 1"));
        assert!(encoded.contains("tcpd_connections_active 1"));
        assert!(encoded.contains("tcpd_tls_handshake_failures_total 1"));
        assert!(encoded.contains("tcpd_handler_failures_total{kind=\"panic\"} 1"));
        assert!(encoded.contains("tcpd_accept_errors_total{kind=\"transient\"} 1"));
        assert!(encoded.contains("tcpd_forced_closes_total 3"));
        assert!(encoded.contains("tcpd_connection_duration_seconds"));
    }

    #[test]
    fn test_metrics_default() {
        let metrics = Metrics::default();
        assert!(!metrics.encode().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        // Grab a free port, then hand it to the metrics server.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.connections_total.inc();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(run_metrics_server(addr, metrics, shutdown.clone()));

        let mut stream = loop {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("tcpd_connections_total 1"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    /// Fails with `failures` transient errors, then with a fatal one.
    struct FailingListener {
        failures: Vec<io::Error>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl Listener for FailingListener {
        type Io = DuplexStream;
        type Addr = String;

        async fn accept(&mut self) -> io::Result<(DuplexStream, String)> {
            self.attempts.lock().unwrap().push(Instant::now());
            Err(self
                .failures
                .pop()
                .unwrap_or_else(|| io::Error::from(io::ErrorKind::PermissionDenied)))
        }

        fn local_addr(&self) -> io::Result<String> {
            Ok("failing".to_string())
        }
    }

    #[tokio::test]
    async fn test_metrics_server_backs_off_on_transient_accept_errors() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let listener = FailingListener {
            failures: vec![
                io::Error::from(io::ErrorKind::ConnectionAborted),
                io::Error::from(io::ErrorKind::Interrupted),
                io::Error::from(io::ErrorKind::ConnectionReset),
            ],
            attempts: attempts.clone(),
        };

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            serve_metrics(listener, Arc::new(Metrics::new().unwrap()), CancellationToken::new()),
        )
        .await
        .expect("metrics server should stop on the fatal error");
        assert!(result.is_err());

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= ACCEPT_RETRY_DELAY);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_metrics_server_retries_fd_exhaustion() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let listener = FailingListener {
            failures: vec![io::Error::from_raw_os_error(libc::EMFILE)],
            attempts: attempts.clone(),
        };

        let result = serve_metrics(
            listener,
            Arc::new(Metrics::new().unwrap()),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.lock().unwrap().len(), 2);
    }
}
