//! Per-connection TCP handling.
//!
//! # Responsibilities
//! - Optional TLS handshake with the client (bounded by the dial timeout)
//! - Backend selection with a per-connection blacklist of failed backends
//! - Piping bytes until both sides finish
//! - Balancer `handle_started`/`handle_done` exactly once per connection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OwnedSemaphorePermit;
use tokio_rustls::TlsAcceptor;

use crate::load_balancer::LoadBalancer;
use crate::net::connection::{ConnectionContext, ConnectionTracker};
use crate::proxy::pipe::{pipe, PipeReport};

/// How a connection ended.
#[derive(Debug)]
pub(crate) enum TcpOutcome {
    /// A backend was reached and the pipe ran to completion.
    Piped { backend: String, report: PipeReport },
    /// The balancer had nothing to offer.
    NoBackend,
    /// Every attempt failed or only blacklisted backends were offered.
    Exhausted,
    /// The TLS handshake failed or timed out.
    HandshakeFailed,
}

/// Everything a spawned connection task needs from its proxy.
#[derive(Clone)]
pub(crate) struct TcpHandler {
    pub listen: Arc<str>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub backend_count: usize,
    pub timeout: Duration,
    pub tls: Option<TlsAcceptor>,
    pub tracker: ConnectionTracker,
}

impl TcpHandler {
    pub(crate) async fn handle<S>(
        self,
        stream: S,
        peer: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) -> TcpOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _permit = permit;
        let ctx = ConnectionContext::new(peer);
        let _conn = self.tracker.track(&ctx);
        self.balancer.handle_started(&ctx);

        let outcome = match &self.tls {
            Some(acceptor) => {
                match tokio::time::timeout(self.timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => self.forward(&ctx, tls_stream).await,
                    Ok(Err(e)) => {
                        tracing::warn!(
                            connection_id = %ctx.id,
                            peer_addr = %peer,
                            error = %e,
                            "TLS handshake failed"
                        );
                        TcpOutcome::HandshakeFailed
                    }
                    Err(_) => {
                        tracing::warn!(
                            connection_id = %ctx.id,
                            peer_addr = %peer,
                            timeout = ?self.timeout,
                            "TLS handshake timed out"
                        );
                        TcpOutcome::HandshakeFailed
                    }
                }
            }
            None => self.forward(&ctx, stream).await,
        };

        self.balancer.handle_done(&ctx);
        outcome
    }

    async fn forward<S>(&self, ctx: &ConnectionContext, client: S) -> TcpOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Backend address → times it was offered again after failing.
        let mut blacklist: HashMap<String, usize> = HashMap::new();
        let mut attempts = 0;

        while attempts < self.backend_count {
            let backend = match self.balancer.next_backend(ctx) {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::warn!(connection_id = %ctx.id, error = %e, "Failed to get backend");
                    return TcpOutcome::NoBackend;
                }
            };

            if let Some(hits) = blacklist.get_mut(&backend.addr) {
                *hits += 1;
                if *hits > self.backend_count {
                    tracing::debug!(
                        connection_id = %ctx.id,
                        backend = %backend,
                        "Only blacklisted backends offered"
                    );
                    break;
                }
                continue;
            }

            attempts += 1;
            match backend.dial(self.timeout).await {
                Ok(upstream) => {
                    let guard = backend.track();
                    tracing::debug!(
                        connection_id = %ctx.id,
                        peer_addr = %ctx.peer,
                        backend = %guard.addr,
                        "Backend connected"
                    );
                    let report = pipe(client, upstream).await;
                    if report.is_clean() {
                        tracing::debug!(
                            connection_id = %ctx.id,
                            to_backend = report.to_backend,
                            to_client = report.to_client,
                            lingered_out = report.lingered_out,
                            "Connection finished"
                        );
                    } else {
                        tracing::info!(
                            connection_id = %ctx.id,
                            backend = %guard.addr,
                            to_backend_error = ?report.to_backend_error,
                            to_client_error = ?report.to_client_error,
                            "Pipe failed"
                        );
                    }
                    return TcpOutcome::Piped {
                        backend: guard.addr.clone(),
                        report,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %ctx.id,
                        backend = %backend,
                        attempt = attempts,
                        error = %e,
                        "Backend dial failed"
                    );
                    blacklist.insert(backend.addr.clone(), 0);
                }
            }
        }

        tracing::error!(
            connection_id = %ctx.id,
            listen = %self.listen,
            peer_addr = %ctx.peer,
            "Failed to reach a running backend"
        );
        TcpOutcome::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::backend::Backend;
    use crate::load_balancer::least_conn::LeastConn;
    use crate::load_balancer::Strategy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    async fn dead_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    async fn echo_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn handler(balancer: Arc<dyn LoadBalancer>, backend_count: usize) -> TcpHandler {
        TcpHandler {
            listen: Arc::from("test"),
            balancer,
            backend_count,
            timeout: Duration::from_secs(2),
            tls: None,
            tracker: ConnectionTracker::new(),
        }
    }

    async fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn retries_until_third_backend_answers() {
        let live = echo_backend().await;
        let dead_a = dead_addr().await;
        let dead_b = dead_addr().await;
        // Round robin starts at index 1: dead_a, dead_b, then live.
        let backends: Vec<_> = [&live, &dead_a, &dead_b]
            .into_iter()
            .map(|a| Arc::new(Backend::new(a.as_str())))
            .collect();
        let balancer = Strategy::RoundRobin.build(backends.clone());

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(handler(balancer, 3).handle(proxy_side, peer(), permit().await));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");

        match task.await.unwrap() {
            TcpOutcome::Piped { backend, report } => {
                assert_eq!(backend, live);
                assert!(report.is_clean());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(backends.iter().all(|b| b.connection_count() == 0));
    }

    #[tokio::test]
    async fn all_backends_failing_drops_connection() {
        let backends = vec![
            Arc::new(Backend::new(dead_addr().await)),
            Arc::new(Backend::new(dead_addr().await)),
            Arc::new(Backend::new(dead_addr().await)),
        ];
        let balancer = Strategy::RoundRobin.build(backends);

        let (mut client, proxy_side) = tokio::io::duplex(64);
        let outcome = handler(balancer, 3)
            .handle(proxy_side, peer(), permit().await)
            .await;
        assert!(matches!(outcome, TcpOutcome::Exhausted));

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blacklist_stops_a_balancer_that_keeps_offering_the_same_backend() {
        let backends = vec![
            Arc::new(Backend::new(dead_addr().await)),
            Arc::new(Backend::new(dead_addr().await)),
        ];
        // Client hash pins the peer to one dead backend.
        let balancer = Strategy::ClientHash.build(backends);

        let (_client, proxy_side) = tokio::io::duplex(64);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            handler(balancer, 2).handle(proxy_side, peer(), permit().await),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, TcpOutcome::Exhausted));
    }

    #[tokio::test]
    async fn empty_pool_reports_no_backend() {
        let balancer = Strategy::RoundRobin.build(Vec::new());
        let (_client, proxy_side) = tokio::io::duplex(64);
        // A budget of one attempt reaches the balancer even with no backends.
        let outcome = handler(balancer, 1)
            .handle(proxy_side, peer(), permit().await)
            .await;
        assert!(matches!(outcome, TcpOutcome::NoBackend));
    }

    #[tokio::test]
    async fn least_conn_is_released_once_after_retries() {
        let live = echo_backend().await;
        let dead = dead_addr().await;
        let lc = Arc::new(LeastConn::new(vec![
            Arc::new(Backend::new(dead.as_str())),
            Arc::new(Backend::new(live.as_str())),
        ]));
        let balancer: Arc<dyn LoadBalancer> = lc.clone();

        let (mut client, proxy_side) = tokio::io::duplex(64);
        let task = tokio::spawn(handler(balancer, 2).handle(proxy_side, peer(), permit().await));

        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();
        assert_eq!(lc.in_flight(), 1);
        assert_eq!(lc.count_of(&live), Some(1));

        client.shutdown().await.unwrap();
        drop(client);
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, TcpOutcome::Piped { .. }));
        assert_eq!(lc.in_flight(), 0);
        assert_eq!(lc.count_of(&live), Some(0));
        assert_eq!(lc.count_of(&dead), Some(0));
    }

    #[tokio::test]
    async fn least_conn_reaches_loaded_backends_past_a_refusing_one() {
        // Port 1 refuses and its address sorts before any other local port.
        let refusing = "127.0.0.1:1".to_string();
        let b = echo_backend().await;
        let c = echo_backend().await;
        let lc = Arc::new(LeastConn::new(vec![
            Arc::new(Backend::new(refusing.as_str())),
            Arc::new(Backend::new(b.as_str())),
            Arc::new(Backend::new(c.as_str())),
        ]));

        let mut held = Vec::new();
        for i in 0..3u16 {
            let balancer: Arc<dyn LoadBalancer> = lc.clone();
            let peer: SocketAddr = format!("127.0.0.1:{}", 50100 + i).parse().unwrap();
            let (mut client, proxy_side) = tokio::io::duplex(64);
            let task = tokio::spawn(handler(balancer, 3).handle(proxy_side, peer, permit().await));

            client.write_all(&[i as u8]).await.unwrap();
            let mut echo = [0u8; 1];
            tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echo))
                .await
                .unwrap()
                .unwrap_or_else(|e| panic!("client {i} dropped: {e}; {}", lc.stats()));
            assert_eq!(echo, [i as u8]);
            held.push((client, task));
        }

        for (client, task) in held {
            drop(client);
            assert!(matches!(task.await.unwrap(), TcpOutcome::Piped { .. }));
        }
        assert_eq!(lc.in_flight(), 0);
        for addr in [&refusing, &b, &c] {
            assert_eq!(lc.count_of(addr), Some(0));
        }
    }
}
