//! Live connection registry.
//!
//! Tracks every connection between accept and worker cleanup, together with
//! the two signals the server can send it:
//! - a cooperative close signal, handed to the handler
//! - a force-close token, watched by the worker
//!
//! Iteration (`for_each`, `len`) takes the read lock; `register` and
//! `unregister` take the write lock.

use crate::handler::CloseSignal;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Process-unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live connection.
#[derive(Debug)]
pub struct RegistryEntry {
    /// Remote address, as reported by the listener.
    pub peer: String,
    /// When the connection was registered.
    pub registered_at: Instant,
    close: CancellationToken,
    kill: CancellationToken,
}

impl RegistryEntry {
    /// Time since the connection was registered.
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Whether a close signal has been sent to this connection.
    pub fn close_requested(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Concurrent map of live connections.
pub struct Registry {
    conns: RwLock<HashMap<ConnectionId, RegistryEntry>>,
    next_id: AtomicU64,
    /// Parent of every per-connection close signal.
    close_root: CancellationToken,
    /// Parent of every per-connection force-close token.
    kill_root: CancellationToken,
    drained: Notify,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            close_root: CancellationToken::new(),
            kill_root: CancellationToken::new(),
            drained: Notify::new(),
        }
    }

    /// Registers a new connection with fresh close and force-close signals.
    ///
    /// Connections registered after [`cancel_all`](Self::cancel_all) or
    /// [`force_close_all`](Self::force_close_all) start out signalled.
    /// The entry is removed when the returned guard is dropped.
    pub fn register(self: &Arc<Self>, peer: impl Into<String>) -> Registration {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let close = self.close_root.child_token();
        let kill = self.kill_root.child_token();

        let entry = RegistryEntry {
            peer: peer.into(),
            registered_at: Instant::now(),
            close: close.clone(),
            kill: kill.clone(),
        };
        let previous = self.conns.write().insert(id, entry);
        debug_assert!(previous.is_none(), "connection {} registered twice", id);

        Registration {
            id,
            registry: Arc::clone(self),
            close,
            kill,
        }
    }

    /// Removes a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut conns = self.conns.write();
        let removed = conns.remove(&id).is_some();
        if removed && conns.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Calls `f` for every live connection while holding the read lock.
    pub fn for_each(&self, mut f: impl FnMut(ConnectionId, &RegistryEntry)) {
        for (id, entry) in self.conns.read().iter() {
            f(*id, entry);
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Sends the close signal to every live connection and to any connection
    /// registered afterwards. Returns the number of live connections signalled.
    pub fn cancel_all(&self) -> usize {
        let mut signalled = 0;
        self.for_each(|_, entry| {
            entry.close.cancel();
            signalled += 1;
        });
        self.close_root.cancel();
        signalled
    }

    /// Force-closes every live connection and any connection registered
    /// afterwards. Returns the number of live connections affected.
    pub fn force_close_all(&self) -> usize {
        let mut forced = 0;
        self.for_each(|id, entry| {
            tracing::debug!(
                "[{}] Force-closing connection {} after {:?}",
                entry.peer,
                id,
                entry.age()
            );
            entry.close.cancel();
            entry.kill.cancel();
            forced += 1;
        });
        self.close_root.cancel();
        self.kill_root.cancel();
        forced
    }

    /// Completes once no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent unregister is not missed.
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Ownership of one registry entry. Dropping it unregisters the connection.
pub struct Registration {
    id: ConnectionId,
    registry: Arc<Registry>,
    close: CancellationToken,
    kill: CancellationToken,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The close signal to hand to the handler.
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal::new(self.close.clone())
    }

    /// Token that fires when the connection must be torn down immediately.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
