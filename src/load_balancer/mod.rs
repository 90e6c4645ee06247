//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Connection accepted → ConnectionContext (id + peer address)
//!     → LoadBalancer::handle_started
//!     → LoadBalancer::next_backend (once per dial attempt):
//!         - round_robin.rs (rotate through backends)
//!         - client_hash.rs (pin client IP to a backend)
//!         - least_conn.rs (approximate fewest in-flight connections)
//!     → backend.rs (dial, connection accounting)
//!     → LoadBalancer::handle_done (connection finished)
//! ```
//!
//! # Design Decisions
//! - Each strategy owns the fixed backend set of its listener
//! - Strategy state lives in the strategy, never in `Backend`
//! - All strategies are `Send + Sync`; stateful ones lock internally

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::net::connection::ConnectionContext;

pub mod backend;
pub mod client_hash;
pub mod least_conn;
pub mod round_robin;

use self::backend::Backend;
use self::client_hash::ClientHash;
use self::least_conn::LeastConn;
use self::round_robin::RoundRobin;

/// Error returned by a strategy that cannot pick a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalancerError {
    #[error("no backend available")]
    NoBackend,
}

/// Backend selection strategy shared by every connection of a listener.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Pick the backend for one dial attempt.
    fn next_backend(&self, ctx: &ConnectionContext) -> Result<Arc<Backend>, BalancerError>;

    /// Called once when the proxy starts working on a connection.
    fn handle_started(&self, _ctx: &ConnectionContext) {}

    /// Called once when the connection's lifetime ends.
    fn handle_done(&self, _ctx: &ConnectionContext) {}

    /// Strategy name as it appears in configuration.
    fn name(&self) -> &'static str;

    /// Human readable state summary.
    fn stats(&self) -> String;
}

/// Known balancing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    ClientHash,
    LeastConn,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "RoundRobin",
            Strategy::ClientHash => "ClientHash",
            Strategy::LeastConn => "LeastConn",
        }
    }

    /// Build the strategy over a fixed backend set.
    pub fn build(self, backends: Vec<Arc<Backend>>) -> Arc<dyn LoadBalancer> {
        match self {
            Strategy::RoundRobin => Arc::new(RoundRobin::new(backends)),
            Strategy::ClientHash => Arc::new(ClientHash::new(backends)),
            Strategy::LeastConn => Arc::new(LeastConn::new(backends)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a strategy name that is not one of [`Strategy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported balancing strategy '{0}'")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    /// Accepts the canonical names plus `Hash`, ignoring case, `_` and `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "" | "roundrobin" => Ok(Strategy::RoundRobin),
            "hash" | "clienthash" => Ok(Strategy::ClientHash),
            "leastconn" | "leastconnections" => Ok(Strategy::LeastConn),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}
