//! # tcpd-server
//!
//! Concurrent TCP connection server.
//!
//! This crate provides:
//! - An accept loop with retry on transient accept errors
//! - A registry of live connections with per-connection close signals
//! - Per-connection workers with optional TLS termination and panic isolation
//! - Immediate close and deadline-bound graceful shutdown
//! - Configuration loading and Prometheus metrics
//!
//! Protocol logic is supplied by the caller as a [`Handler`].

pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod metrics;
pub mod registry;
pub mod server;
mod shutdown;
pub mod stream;
pub mod tls;
mod worker;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, ShutdownConfig, TlsConfig};
pub use error::ServerError;
pub use handler::{handler_fn, CloseSignal, Echo, Handler, HandlerError, HandlerFn};
pub use listener::Listener;
pub use metrics::Metrics;
pub use registry::{ConnectionId, Registry};
pub use server::{Server, ServerConfig, ServerStats, ACCEPT_RETRY_DELAY};
pub use stream::MaybeTlsStream;
