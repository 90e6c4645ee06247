//! Per-listener proxy engine.
//!
//! # Data Flow
//! ```text
//! ListenerSpec
//!     → Proxy::new (strategy, backends, TLS material)
//!     → Proxy::bind (TCP listener or UDP socket)
//!     → Proxy::serve
//!         tcp: accept loop → tcp.rs handler per connection → pipe.rs
//!         udp: receive loop → udp.rs task per datagram
//!     → Proxy::close → loop exits → handlers drain → Stopped
//! ```
//!
//! # Design Decisions
//! - State transitions are published on a `watch` channel; callers await
//!   `Stopped` instead of polling
//! - Every in-flight connection or datagram holds a semaphore permit
//! - Handlers run in a `JoinSet` so a drain can be bounded and aborted

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::config::{ListenerSpec, Protocol};
use crate::load_balancer::backend::{Backend, BackendSnapshot};
use crate::load_balancer::{LoadBalancer, Strategy, UnknownStrategy};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{accept_loop, AcceptExit, Acceptor, BoundListener, ACCEPT_BACKOFF};
use crate::net::tls::{load_tls_acceptor, TlsError};

pub mod pipe;
pub mod tcp;
pub mod udp;

use self::tcp::TcpHandler;
use self::udp::{UdpHandler, UDP_REPLY_TIMEOUT};

/// Error type for proxy construction and serving.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{listen}: {source}")]
    Strategy {
        listen: String,
        source: UnknownStrategy,
    },
    #[error("{listen}: failed to load TLS material: {source}")]
    Tls { listen: String, source: TlsError },
    #[error("failed to bind {protocol} listener on {listen}: {source}")]
    Bind {
        listen: String,
        protocol: Protocol,
        source: io::Error,
    },
    #[error("{listen}: accept failed: {source}")]
    Accept { listen: String, source: io::Error },
    #[error("{listen}: proxy was already started")]
    AlreadyStarted { listen: String },
}

/// Tunables shared by every proxy of a generation.
#[derive(Debug, Clone, Copy)]
pub struct ProxyOptions {
    /// Upper bound on awaiting in-flight handlers after close. `None` waits
    /// for all of them.
    pub drain_timeout: Option<Duration>,
    /// Delay before accepting again after descriptor exhaustion.
    pub accept_backoff: Duration,
    /// How long a UDP backend has to reply.
    pub udp_reply_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            drain_timeout: None,
            accept_backoff: ACCEPT_BACKOFF,
            udp_reply_timeout: UDP_REPLY_TIMEOUT,
        }
    }
}

/// Lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Created,
    Listening,
    Stopped,
}

/// Serializable view of a proxy for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub listen_addr: String,
    pub local_addr: Option<SocketAddr>,
    pub protocol: Protocol,
    pub strategy: &'static str,
    pub tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub state: ProxyState,
    pub active_connections: u64,
    pub backends: Vec<BackendSnapshot>,
    pub stats: String,
}

/// One listener and the backends it balances across.
pub struct Proxy {
    spec: ListenerSpec,
    backends: Vec<Arc<Backend>>,
    balancer: Arc<dyn LoadBalancer>,
    tls: Option<TlsAcceptor>,
    options: ProxyOptions,
    limit: Arc<Semaphore>,
    tracker: ConnectionTracker,
    close_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ProxyState>,
    local_addr: OnceLock<SocketAddr>,
    bound: AtomicBool,
    started: AtomicBool,
}

impl Proxy {
    /// Build a proxy for one listener entry. Nothing is bound yet.
    pub fn new(spec: ListenerSpec, options: ProxyOptions) -> Result<Self, ProxyError> {
        let mut strategy = spec.strategy().map_err(|source| ProxyError::Strategy {
            listen: spec.listen_addr.clone(),
            source,
        })?;
        if spec.protocol == Protocol::Udp && strategy == Strategy::LeastConn {
            tracing::warn!(
                listen = %spec.listen_addr,
                "LeastConn is not supported for udp listeners, using RoundRobin"
            );
            strategy = Strategy::RoundRobin;
        }

        let backends: Vec<Arc<Backend>> = spec
            .backend_addrs()
            .map(|addr| Arc::new(Backend::new(addr)))
            .collect();
        let balancer = strategy.build(backends.clone());

        let tls = match spec.tls_paths() {
            Some((cert, key)) if spec.protocol == Protocol::Tcp => {
                let acceptor =
                    load_tls_acceptor(cert, key).map_err(|source| ProxyError::Tls {
                        listen: spec.listen_addr.clone(),
                        source,
                    })?;
                Some(acceptor)
            }
            _ => None,
        };

        let (close_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ProxyState::Created);

        Ok(Self {
            limit: Arc::new(Semaphore::new(spec.max_connections.max(1))),
            spec,
            backends,
            balancer,
            tls,
            options,
            tracker: ConnectionTracker::new(),
            close_tx,
            state_tx,
            local_addr: OnceLock::new(),
            bound: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn listen_addr(&self) -> &str {
        &self.spec.listen_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.spec.protocol
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Address actually bound, once [`Proxy::bind`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn state(&self) -> ProxyState {
        *self.state_tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ProxyState::Stopped
    }

    /// Bind the listening socket for this entry.
    ///
    /// Once bound, the proxy only reports `Stopped` when [`Proxy::serve`]
    /// returns, so the listener must be handed to it.
    pub async fn bind(&self) -> Result<BoundListener, ProxyError> {
        let listener = BoundListener::bind(self.spec.protocol, &self.spec.bind_addr())
            .await
            .map_err(|source| ProxyError::Bind {
                listen: self.spec.listen_addr.clone(),
                protocol: self.spec.protocol,
                source,
            })?;
        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        self.bound.store(true, Ordering::SeqCst);
        Ok(listener)
    }

    /// Bind and serve until closed.
    pub async fn run(&self) -> Result<(), ProxyError> {
        match self.bind().await {
            Ok(listener) => self.serve(listener).await,
            Err(e) => {
                self.state_tx.send_replace(ProxyState::Stopped);
                Err(e)
            }
        }
    }

    /// Serve on an already bound listener until closed or accept fails.
    ///
    /// Returns once the listener is released and in-flight handlers have
    /// drained; the proxy is `Stopped` afterwards either way.
    pub async fn serve(&self, listener: BoundListener) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted {
                listen: self.spec.listen_addr.clone(),
            });
        }

        match listener {
            BoundListener::Tcp(tcp) => self.serve_acceptor(tcp).await,
            BoundListener::Udp(socket) => self.serve_datagrams(socket).await,
        }
    }

    /// Accept loop over any [`Acceptor`]. The acceptor is released before
    /// in-flight connections are drained.
    pub(crate) async fn serve_acceptor<A: Acceptor>(&self, mut acceptor: A) -> Result<(), ProxyError> {
        self.state_tx.send_replace(ProxyState::Listening);
        tracing::info!(
            listen = %self.spec.listen_addr,
            protocol = %self.spec.protocol,
            strategy = self.balancer.name(),
            tls = self.tls.is_some(),
            "Proxy listening"
        );

        let handler = TcpHandler {
            listen: Arc::from(self.spec.listen_addr.as_str()),
            balancer: self.balancer.clone(),
            backend_count: self.backends.len(),
            timeout: self.spec.timeout(),
            tls: self.tls.clone(),
            tracker: self.tracker.clone(),
        };
        let mut tasks = JoinSet::new();
        let mut close = self.close_tx.subscribe();

        let exit = accept_loop(
            &mut acceptor,
            &mut close,
            &self.limit,
            self.options.accept_backoff,
            |stream, peer, permit| {
                while tasks.try_join_next().is_some() {}
                let handler = handler.clone();
                let span = tracing::debug_span!("connection", listen = %handler.listen, peer_addr = %peer);
                tasks.spawn(
                    async move {
                        handler.handle(stream, peer, permit).await;
                    }
                    .instrument(span),
                );
            },
        )
        .await;
        drop(acceptor);

        self.finish(exit, tasks).await
    }

    async fn serve_datagrams(&self, socket: UdpSocket) -> Result<(), ProxyError> {
        self.state_tx.send_replace(ProxyState::Listening);
        tracing::info!(
            listen = %self.spec.listen_addr,
            protocol = %self.spec.protocol,
            strategy = self.balancer.name(),
            "Proxy listening"
        );

        let handler = UdpHandler {
            balancer: self.balancer.clone(),
            reply_timeout: self.options.udp_reply_timeout,
            tracker: self.tracker.clone(),
        };
        let mut tasks = JoinSet::new();
        let mut close = self.close_tx.subscribe();

        let exit = udp::serve(
            Arc::new(socket),
            &handler,
            &mut close,
            &self.limit,
            self.options.accept_backoff,
            &mut tasks,
        )
        .await;

        self.finish(exit, tasks).await
    }

    async fn finish(&self, exit: AcceptExit, mut tasks: JoinSet<()>) -> Result<(), ProxyError> {
        let result = match exit {
            AcceptExit::Closed => Ok(()),
            AcceptExit::Failed(source) => {
                tracing::error!(
                    listen = %self.spec.listen_addr,
                    error = %source,
                    "Accept failed, stopping proxy"
                );
                Err(ProxyError::Accept {
                    listen: self.spec.listen_addr.clone(),
                    source,
                })
            }
        };

        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(
                listen = %self.spec.listen_addr,
                in_flight,
                "Draining connections"
            );
        }
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        match self.options.drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, drain).await.is_err() {
                    tracing::warn!(
                        listen = %self.spec.listen_addr,
                        remaining = tasks.len(),
                        "Drain timeout elapsed, aborting connections"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                }
            }
            None => drain.await,
        }

        self.state_tx.send_replace(ProxyState::Stopped);
        tracing::info!(listen = %self.spec.listen_addr, "Proxy stopped");
        result
    }

    /// Ask the proxy to stop accepting. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
        if !self.bound.load(Ordering::SeqCst) {
            self.state_tx.send_replace(ProxyState::Stopped);
        }
    }

    /// Wait until the proxy reports `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut state = self.state_tx.subscribe();
        let _ = state.wait_for(|s| *s == ProxyState::Stopped).await;
    }

    /// Active connection count, backend counters and balancer state.
    pub fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            listen_addr: self.spec.listen_addr.clone(),
            local_addr: self.local_addr(),
            protocol: self.spec.protocol,
            strategy: self.balancer.name(),
            tls: self.tls.is_some(),
            comment: self.spec.comment.clone(),
            state: self.state(),
            active_connections: self.tracker.active_count(),
            backends: self.backends.iter().map(|b| b.snapshot()).collect(),
            stats: self.balancer.stats(),
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("listen_addr", &self.spec.listen_addr)
            .field("protocol", &self.spec.protocol)
            .field("strategy", &self.balancer.name())
            .field("state", &self.state())
            .finish()
    }
}
