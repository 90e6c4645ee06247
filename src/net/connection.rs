//! Per-connection context and in-flight accounting.
//!
//! A TCP connection and a single UDP datagram are both "connections" here:
//! each gets an id for log correlation and a [`ConnectionContext`] that the
//! balancer sees.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id, rendered as `conn-<n>` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a balancer gets to see about a connection (or UDP datagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    /// Remote address of the client.
    pub peer: SocketAddr,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
        }
    }
}

/// In-flight counter shared by every handler of one proxy.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    in_flight: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `ctx` as in flight until the returned guard is dropped.
    pub fn track(&self, ctx: &ConnectionContext) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            in_flight: self.in_flight.clone(),
            id: ctx.id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Releases one in-flight slot on drop.
#[derive(Debug)]
pub struct InFlight {
    in_flight: Arc<AtomicU64>,
    id: ConnectionId,
}

impl InFlight {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection finished");
    }
}
