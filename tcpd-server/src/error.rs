//! Server error types.

use crate::handler::HandlerError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-transient accept failure. Terminates the accept loop.
    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// Graceful shutdown ran out of time; `remaining` connections were force-closed.
    #[error("shutdown deadline exceeded ({remaining} connection(s) force-closed)")]
    DeadlineExceeded { remaining: usize },
}

impl ServerError {
    /// Returns whether this error came from a shutdown deadline expiring.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, ServerError::DeadlineExceeded { .. })
    }

    /// Returns a short label suitable for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "io",
            ServerError::Accept(_) => "accept",
            ServerError::TlsConfig(_) => "tls_config",
            ServerError::TlsHandshake(_) => "tls_handshake",
            ServerError::Handler(_) => "handler",
            ServerError::DeadlineExceeded { .. } => "deadline_exceeded",
        }
    }
}
