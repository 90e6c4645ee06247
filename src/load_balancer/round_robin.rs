//! Round-robin load balancing strategy.

use std::sync::{Arc, Mutex, PoisonError};

use crate::load_balancer::{backend::Backend, BalancerError, LoadBalancer};
use crate::net::connection::ConnectionContext;

/// Round-robin selector.
/// Advances a shared cursor before every pick, so the first call returns the
/// second backend.
#[derive(Debug)]
pub struct RoundRobin {
    backends: Vec<Arc<Backend>>,
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            cursor: Mutex::new(0),
        }
    }
}

impl LoadBalancer for RoundRobin {
    fn next_backend(&self, _ctx: &ConnectionContext) -> Result<Arc<Backend>, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoBackend);
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        *cursor = (*cursor + 1) % self.backends.len();
        Ok(self.backends[*cursor].clone())
    }

    fn name(&self) -> &'static str {
        "RoundRobin"
    }

    fn stats(&self) -> String {
        let cursor = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let addrs: Vec<&str> = self.backends.iter().map(|b| b.addr.as_str()).collect();
        format!("backends: [{}], index: {}", addrs.join(", "), cursor)
    }
}
