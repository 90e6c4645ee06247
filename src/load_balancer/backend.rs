//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream server by its `host:port` address
//! - Track active connections established through the proxy
//! - Dial the backend over TCP (bounded by a timeout) or UDP

use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{lookup_host, TcpStream, UdpSocket};

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// The `host:port` address of the backend. This is its identity.
    pub addr: String,
    /// Number of currently active proxied connections.
    pub active_connections: AtomicUsize,
}

impl Backend {
    /// Create a new backend.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Get the current number of active connections.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment active connection count.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connection count.
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment the connection count and return a guard that undoes it on drop.
    pub fn track(self: &Arc<Self>) -> BackendConnectionGuard {
        self.inc_connections();
        BackendConnectionGuard {
            backend: self.clone(),
        }
    }

    /// Open a TCP connection, failing if it is not established within `timeout`.
    pub async fn dial(&self, timeout: Duration) -> io::Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {} timed out after {:?}", self.addr, timeout),
            )),
        }
    }

    /// Open a fresh UDP socket connected to this backend.
    pub async fn dial_udp(&self) -> io::Result<UdpSocket> {
        let target = lookup_host(self.addr.as_str()).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {}", self.addr),
            )
        })?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(socket)
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            address: self.addr.clone(),
            active_connections: self.connection_count(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Serializable backend status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSnapshot {
    pub address: String,
    pub active_connections: usize,
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    pub backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_connections();
    }
}
