//! Accept-side abstraction.
//!
//! The accept loop only needs "give me the next connection"; anything that
//! can do that (a bound TCP socket, a test double) implements [`Listener`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A source of inbound connections.
pub trait Listener: Send + 'static {
    /// The byte stream of an accepted connection.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// The remote address of an accepted connection.
    type Addr: fmt::Display + Send + 'static;

    /// Waits for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Binds a plain TCP listener.
pub async fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!("Bound TCP listener on {}", listener.local_addr()?);
    Ok(listener)
}

/// Returns whether an accept error is worth retrying.
///
/// Covers aborted handshakes, interrupted calls, and running out of file
/// descriptors or buffer space. Everything else leaves the listener unusable.
pub fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => is_resource_exhaustion(err),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}
