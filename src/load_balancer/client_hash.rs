//! Client IP hashing strategy.
//!
//! The backend index is the sum of the client address bytes modulo the
//! number of backends. IPv4 clients are hashed in their IPv4-mapped IPv6
//! form so both address families share one keyspace.
//!
//! Assumes every backend is up: a dead backend keeps receiving its share of
//! clients, and the retry loop in the proxy is the only failover.

use std::net::IpAddr;
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, BalancerError, LoadBalancer};
use crate::net::connection::ConnectionContext;

#[derive(Debug)]
pub struct ClientHash {
    backends: Vec<Arc<Backend>>,
}

impl ClientHash {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends }
    }

    /// Index into a pool of `len` backends for the given client IP.
    pub fn index_for(ip: IpAddr, len: usize) -> usize {
        let octets = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        let sum: usize = octets.iter().map(|b| *b as usize).sum();
        sum % len
    }
}

impl LoadBalancer for ClientHash {
    fn next_backend(&self, ctx: &ConnectionContext) -> Result<Arc<Backend>, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoBackend);
        }
        let index = Self::index_for(ctx.peer.ip(), self.backends.len());
        Ok(self.backends[index].clone())
    }

    fn name(&self) -> &'static str {
        "ClientHash"
    }

    fn stats(&self) -> String {
        let addrs: Vec<&str> = self.backends.iter().map(|b| b.addr.as_str()).collect();
        format!("backends: [{}]", addrs.join(", "))
    }
}
