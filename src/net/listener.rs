//! Listener binding and the accept loop.
//!
//! # Responsibilities
//! - Bind TCP or UDP sockets for a listener entry
//! - Accept incoming connections under a connection limit
//! - Back off on file descriptor exhaustion instead of exiting
//! - Exit cleanly when the owning proxy is closed

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::Protocol;

/// Delay before retrying accept after running out of file descriptors.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

#[cfg(unix)]
const EXHAUSTION_CODES: &[i32] = &[23 /* ENFILE */, 24 /* EMFILE */];
#[cfg(windows)]
const EXHAUSTION_CODES: &[i32] = &[10024 /* WSAEMFILE */];
#[cfg(not(any(unix, windows)))]
const EXHAUSTION_CODES: &[i32] = &[];

/// True when an accept failed because the process or system ran out of
/// file descriptors.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        if EXHAUSTION_CODES.contains(&code) {
            return true;
        }
    }
    err.to_string()
        .to_ascii_lowercase()
        .contains("too many open files")
}

/// A bound socket, before its proxy starts serving on it.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl BoundListener {
    /// Bind `addr` for the given protocol.
    pub async fn bind(protocol: Protocol, addr: &str) -> io::Result<Self> {
        let listener = match protocol {
            Protocol::Tcp => BoundListener::Tcp(TcpListener::bind(addr).await?),
            Protocol::Udp => BoundListener::Udp(UdpSocket::bind(addr).await?),
        };
        tracing::info!(
            protocol = %protocol,
            address = %listener.local_addr()?,
            "Listener bound"
        );
        Ok(listener)
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BoundListener::Tcp(l) => l.local_addr(),
            BoundListener::Udp(s) => s.local_addr(),
        }
    }
}

/// Source of inbound streams for [`accept_loop`].
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(&*self)
    }
}

/// Why an accept loop returned.
#[derive(Debug)]
pub enum AcceptExit {
    /// The owning proxy was closed.
    Closed,
    /// Accept failed with a non-recoverable error.
    Failed(io::Error),
}

/// Accept connections until `close` flips to `true` or accept fails with
/// anything other than descriptor exhaustion.
///
/// A permit from `limit` is acquired before each accept and handed to
/// `on_accept` together with the stream; it must be held for the
/// connection's lifetime.
pub async fn accept_loop<A, F>(
    acceptor: &mut A,
    close: &mut watch::Receiver<bool>,
    limit: &Arc<Semaphore>,
    backoff: Duration,
    mut on_accept: F,
) -> AcceptExit
where
    A: Acceptor,
    F: FnMut(A::Stream, SocketAddr, OwnedSemaphorePermit),
{
    loop {
        let (permit, accepted) = tokio::select! {
            biased;
            _ = close.wait_for(|closed| *closed) => return AcceptExit::Closed,
            accepted = async {
                let permit = limit.clone().acquire_owned().await;
                (permit, acceptor.accept().await)
            } => accepted,
        };

        let Ok(permit) = permit else {
            return AcceptExit::Closed;
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(
                    peer_addr = %peer,
                    available_permits = limit.available_permits(),
                    "Connection accepted"
                );
                on_accept(stream, peer, permit);
            }
            Err(e) if is_resource_exhaustion(&e) => {
                drop(permit);
                tracing::warn!(error = %e, backoff = ?backoff, "Accept failed, backing off");
                tokio::select! {
                    biased;
                    _ = close.wait_for(|closed| *closed) => return AcceptExit::Closed,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => return AcceptExit::Failed(e),
        }
    }
}
