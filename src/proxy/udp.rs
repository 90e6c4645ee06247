//! Per-datagram UDP forwarding.
//!
//! Every datagram received on the listening socket is handled on its own:
//! a backend is chosen, a fresh socket connected to it forwards the payload,
//! exactly one reply is awaited (bounded by a deadline) and sent back to the
//! original client. No session state is kept between datagrams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::load_balancer::backend::Backend;
use crate::load_balancer::LoadBalancer;
use crate::net::connection::{ConnectionContext, ConnectionTracker};
use crate::net::listener::{is_resource_exhaustion, AcceptExit};

/// Largest datagram accepted from a client or a backend.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// How long a backend has to answer a forwarded datagram.
pub const UDP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a spawned datagram task needs from its proxy.
#[derive(Clone)]
pub(crate) struct UdpHandler {
    pub balancer: Arc<dyn LoadBalancer>,
    pub reply_timeout: Duration,
    pub tracker: ConnectionTracker,
}

impl UdpHandler {
    /// Forward one datagram and relay the backend's reply.
    pub(crate) async fn forward(
        self,
        listener: Arc<UdpSocket>,
        datagram: Vec<u8>,
        client: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        let _permit = permit;
        let ctx = ConnectionContext::new(client);
        let _conn = self.tracker.track(&ctx);
        self.balancer.handle_started(&ctx);

        match self.balancer.next_backend(&ctx) {
            Ok(backend) => {
                match exchange(&backend, &datagram, self.reply_timeout).await {
                    Ok(reply) => match listener.send_to(&reply, client).await {
                        Ok(_) => tracing::trace!(
                            connection_id = %ctx.id,
                            backend = %backend,
                            request_bytes = datagram.len(),
                            reply_bytes = reply.len(),
                            "Datagram relayed"
                        ),
                        Err(e) => tracing::warn!(
                            connection_id = %ctx.id,
                            peer_addr = %client,
                            error = %e,
                            "Failed to send reply to client"
                        ),
                    },
                    Err(e) => tracing::warn!(
                        connection_id = %ctx.id,
                        backend = %backend,
                        error = %e,
                        "Datagram exchange failed"
                    ),
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %ctx.id, error = %e, "Failed to get backend");
            }
        }

        self.balancer.handle_done(&ctx);
    }
}

/// Send `datagram` to `backend` and wait for a single reply.
async fn exchange(backend: &Arc<Backend>, datagram: &[u8], reply_timeout: Duration) -> io::Result<Vec<u8>> {
    let _guard = backend.track();
    let socket = backend.dial_udp().await?;
    socket.send(datagram).await?;

    let mut reply = vec![0u8; UDP_BUFFER_SIZE];
    let n = tokio::time::timeout(reply_timeout, socket.recv(&mut reply))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no reply from {} within {:?}", backend.addr, reply_timeout),
            )
        })??;
    reply.truncate(n);
    Ok(reply)
}

/// Read datagrams until `close` flips or the socket fails.
///
/// Each datagram holds a permit from `limit` while it is in flight.
pub(crate) async fn serve(
    socket: Arc<UdpSocket>,
    handler: &UdpHandler,
    close: &mut watch::Receiver<bool>,
    limit: &Arc<Semaphore>,
    backoff: Duration,
    tasks: &mut JoinSet<()>,
) -> AcceptExit {
    loop {
        let (permit, received) = tokio::select! {
            biased;
            _ = close.wait_for(|closed| *closed) => return AcceptExit::Closed,
            received = async {
                let permit = limit.clone().acquire_owned().await;
                let mut buf = vec![0u8; UDP_BUFFER_SIZE];
                let received = socket.recv_from(&mut buf).await.map(|(n, client)| {
                    buf.truncate(n);
                    (buf, client)
                });
                (permit, received)
            } => received,
        };

        let Ok(permit) = permit else {
            return AcceptExit::Closed;
        };

        match received {
            Ok((datagram, client)) => {
                while tasks.try_join_next().is_some() {}
                tasks.spawn(handler.clone().forward(socket.clone(), datagram, client, permit));
            }
            Err(e) if is_resource_exhaustion(&e) => {
                drop(permit);
                tracing::warn!(error = %e, backoff = ?backoff, "Receive failed, backing off");
                tokio::select! {
                    biased;
                    _ = close.wait_for(|closed| *closed) => return AcceptExit::Closed,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                // ICMP port unreachable surfaced on the listening socket.
                tracing::debug!(error = %e, "Ignoring connection reset on UDP socket");
            }
            Err(e) => return AcceptExit::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::Strategy;

    async fn udp_echo_backend() -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn silent_backend() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        (socket, addr)
    }

    #[tokio::test]
    async fn exchange_returns_reply() {
        let backend = Arc::new(Backend::new(udp_echo_backend().await));
        let reply = exchange(&backend, b"query", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"query");
        assert_eq!(backend.connection_count(), 0);
    }

    #[tokio::test]
    async fn exchange_times_out_without_reply() {
        let (_silent, addr) = silent_backend().await;
        let backend = Arc::new(Backend::new(addr));
        let err = exchange(&backend, b"query", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(backend.connection_count(), 0);
    }

    #[tokio::test]
    async fn serve_relays_datagrams_until_closed() {
        let backends = vec![
            Arc::new(Backend::new(udp_echo_backend().await)),
            Arc::new(Backend::new(udp_echo_backend().await)),
        ];
        let handler = UdpHandler {
            balancer: Strategy::RoundRobin.build(backends),
            reply_timeout: Duration::from_secs(2),
            tracker: ConnectionTracker::new(),
        };
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listen = socket.local_addr().unwrap();
        let (close_tx, mut close_rx) = watch::channel(false);
        let limit = Arc::new(Semaphore::new(8));

        let server = tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            let exit = serve(
                socket,
                &handler,
                &mut close_rx,
                &limit,
                Duration::from_millis(10),
                &mut tasks,
            )
            .await;
            while tasks.join_next().await.is_some() {}
            exit
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen).await.unwrap();
        for i in 0..4 {
            let msg = format!("datagram-{i}");
            client.send(msg.as_bytes()).await.unwrap();
            let mut buf = [0u8; 64];
            let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], msg.as_bytes());
        }

        close_tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, AcceptExit::Closed));
    }
}
