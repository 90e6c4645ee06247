//! Approximate least connections load balancing strategy.
//!
//! Backends are scanned in sorted address order, starting one past the last
//! assignment. A backend whose count is strictly below the `min` watermark is
//! taken immediately; otherwise the first backend at exactly `min` is taken
//! once the whole cycle has been scanned.
//!
//! `min` is set to the chosen backend's count after every selection and is
//! not recomputed when connections finish. It only drops implicitly, when a
//! later scan finds a backend strictly below it. A stale `min` can therefore
//! prefer a lightly loaded backend over an idle one further along the scan.
//!
//! Every pick made for a connection, including picks whose dial failed, stays
//! counted until `handle_done`. A failed backend therefore rises above the
//! watermark and a retry moves on to the next backend in the scan.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::load_balancer::{backend::Backend, BalancerError, LoadBalancer};
use crate::net::connection::ConnectionContext;

#[derive(Debug)]
struct Slot {
    backend: Arc<Backend>,
    count: usize,
}

#[derive(Debug, Default)]
struct State {
    /// One slot per distinct address, sorted by address.
    slots: Vec<Slot>,
    /// In-flight client address → every slot picked for it.
    active: HashMap<SocketAddr, Vec<usize>>,
    min: usize,
    next_index: usize,
}

/// Least connections selector with its own per-backend counters.
#[derive(Debug)]
pub struct LeastConn {
    state: Mutex<State>,
}

impl LeastConn {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        let mut by_addr: HashMap<String, Arc<Backend>> = HashMap::new();
        for backend in backends {
            by_addr.entry(backend.addr.clone()).or_insert(backend);
        }
        let mut slots: Vec<Slot> = by_addr
            .into_values()
            .map(|backend| Slot { backend, count: 0 })
            .collect();
        slots.sort_by(|a, b| a.backend.addr.cmp(&b.backend.addr));

        Self {
            state: Mutex::new(State {
                slots,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current watermark.
    pub fn min(&self) -> usize {
        self.lock().min
    }

    /// Tracked count for `addr`, if it is one of the backends.
    pub fn count_of(&self, addr: &str) -> Option<usize> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.backend.addr == addr)
            .map(|s| s.count)
    }

    /// Number of connections currently mapped to a backend.
    pub fn in_flight(&self) -> usize {
        self.lock().active.len()
    }
}

impl LoadBalancer for LeastConn {
    fn next_backend(&self, ctx: &ConnectionContext) -> Result<Arc<Backend>, BalancerError> {
        let mut state = self.lock();
        let len = state.slots.len();
        if len == 0 {
            return Err(BalancerError::NoBackend);
        }

        let mut below = None;
        let mut at_min = None;
        for step in 0..len {
            let i = (state.next_index + step) % len;
            let count = state.slots[i].count;
            if count < state.min {
                below = Some(i);
                break;
            }
            if count == state.min && at_min.is_none() {
                at_min = Some(i);
            }
        }
        let chosen = below.or(at_min).ok_or(BalancerError::NoBackend)?;

        state.next_index = (chosen + 1) % len;
        state.slots[chosen].count += 1;
        state.min = state.slots[chosen].count;
        state.active.entry(ctx.peer).or_default().push(chosen);
        Ok(state.slots[chosen].backend.clone())
    }

    fn handle_done(&self, ctx: &ConnectionContext) {
        let mut state = self.lock();
        if let Some(picked) = state.active.remove(&ctx.peer) {
            for index in picked {
                let slot = &mut state.slots[index];
                slot.count = slot.count.saturating_sub(1);
            }
        }
    }

    fn name(&self) -> &'static str {
        "LeastConn"
    }

    fn stats(&self) -> String {
        let state = self.lock();
        let counts: Vec<String> = state
            .slots
            .iter()
            .map(|s| format!("{}: {}", s.backend.addr, s.count))
            .collect();
        format!(
            "backends: {{{}}}, active: {}, min: {}",
            counts.join(", "),
            state.active.len(),
            state.min
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(n: usize) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| Arc::new(Backend::new(format!("127.0.0.1:{}", 9000 + i))))
            .collect()
    }

    fn client(i: usize) -> ConnectionContext {
        ConnectionContext::new(format!("10.0.0.1:{}", 40000 + i).parse().unwrap())
    }

    #[test]
    fn test_least_conn() {
        let pool = backends(3);
        let lb = LeastConn::new(pool.clone());

        assert_eq!(lb.next_backend(&client(0)).unwrap().addr, pool[0].addr);
        assert_eq!(lb.next_backend(&client(1)).unwrap().addr, pool[1].addr);
        assert_eq!(lb.next_backend(&client(2)).unwrap().addr, pool[2].addr);

        // b0 finishes; it is now the only backend below the watermark.
        lb.handle_done(&client(0));
        assert_eq!(lb.next_backend(&client(3)).unwrap().addr, pool[0].addr);
    }

    #[test]
    fn scan_order_is_sorted_by_address() {
        let pool = vec![
            Arc::new(Backend::new("127.0.0.1:9002")),
            Arc::new(Backend::new("127.0.0.1:9000")),
            Arc::new(Backend::new("127.0.0.1:9001")),
        ];
        let lb = LeastConn::new(pool);
        let picks: Vec<String> = (0..3)
            .map(|i| lb.next_backend(&client(i)).unwrap().addr.clone())
            .collect();
        assert_eq!(picks, ["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"]);
    }

    #[test]
    fn without_completions_load_stays_level() {
        for n in 2..6 {
            let pool = backends(n);
            let lb = LeastConn::new(pool.clone());
            for i in 0..(n * 7 + 3) {
                lb.next_backend(&client(i)).unwrap();
                let counts: Vec<usize> = pool
                    .iter()
                    .map(|b| lb.count_of(&b.addr).unwrap())
                    .collect();
                let max = *counts.iter().max().unwrap();
                let min = *counts.iter().min().unwrap();
                assert!(max - min <= 1, "n={n} counts={counts:?}");
            }
        }
    }

    #[test]
    fn done_releases_count_and_mapping_once() {
        let pool = backends(2);
        let lb = LeastConn::new(pool.clone());

        lb.next_backend(&client(0)).unwrap();
        assert_eq!(lb.in_flight(), 1);
        assert_eq!(lb.count_of(&pool[0].addr), Some(1));

        lb.handle_done(&client(0));
        assert_eq!(lb.in_flight(), 0);
        assert_eq!(lb.count_of(&pool[0].addr), Some(0));

        // A second completion for the same client is a no-op.
        lb.handle_done(&client(0));
        assert_eq!(lb.count_of(&pool[0].addr), Some(0));
    }

    #[test]
    fn retry_keeps_failed_pick_counted_until_done() {
        let pool = backends(2);
        let lb = LeastConn::new(pool.clone());
        let ctx = client(0);

        let first = lb.next_backend(&ctx).unwrap();
        let second = lb.next_backend(&ctx).unwrap();
        assert_ne!(first.addr, second.addr);
        assert_eq!(lb.count_of(&first.addr), Some(1));
        assert_eq!(lb.count_of(&second.addr), Some(1));
        assert_eq!(lb.in_flight(), 1);

        lb.handle_done(&ctx);
        assert_eq!(lb.count_of(&first.addr), Some(0));
        assert_eq!(lb.count_of(&second.addr), Some(0));
        assert_eq!(lb.in_flight(), 0);
    }

    /// b0 refuses connections and sorts first while b1 and b2 already carry
    /// load. A retry after the failed pick must land on a loaded backend
    /// instead of being offered b0 again.
    #[test]
    fn retry_moves_past_failed_backend_when_others_are_loaded() {
        let pool = backends(3);
        let lb = LeastConn::new(pool.clone());

        // client 0: b0 fails, retry lands on b1.
        assert_eq!(lb.next_backend(&client(0)).unwrap().addr, pool[0].addr);
        assert_eq!(lb.next_backend(&client(0)).unwrap().addr, pool[1].addr);
        // client 1 goes straight to b2.
        assert_eq!(lb.next_backend(&client(1)).unwrap().addr, pool[2].addr);

        // client 2: b0 again, then a healthy backend rather than b0.
        assert_eq!(lb.next_backend(&client(2)).unwrap().addr, pool[0].addr);
        let retry = lb.next_backend(&client(2)).unwrap();
        assert_ne!(retry.addr, pool[0].addr);

        for i in 0..3 {
            lb.handle_done(&client(i));
        }
        assert_eq!(lb.in_flight(), 0);
        for b in &pool {
            assert_eq!(lb.count_of(&b.addr), Some(0));
        }
    }

    /// The watermark is not lowered by completions. After the only connections
    /// on b0 finish, b0 is idle but the stale `min` of 2 lets b1 (count 1)
    /// win because it is the first backend strictly below the watermark.
    #[test]
    fn watermark_stays_stale_after_completions() {
        let pool = backends(2);
        let lb = LeastConn::new(pool.clone());

        assert_eq!(lb.next_backend(&client(1)).unwrap().addr, pool[0].addr);
        assert_eq!(lb.next_backend(&client(2)).unwrap().addr, pool[1].addr);
        assert_eq!(lb.next_backend(&client(3)).unwrap().addr, pool[0].addr);
        assert_eq!(lb.min(), 2);

        lb.handle_done(&client(3));
        lb.handle_done(&client(1));
        assert_eq!(lb.count_of(&pool[0].addr), Some(0));
        assert_eq!(lb.min(), 2);

        assert_eq!(lb.next_backend(&client(4)).unwrap().addr, pool[1].addr);
        assert_eq!(lb.min(), 2);
    }

    #[test]
    fn sole_connection_done_returns_count_to_zero() {
        let pool = backends(3);
        let lb = LeastConn::new(pool.clone());
        let b = lb.next_backend(&client(0)).unwrap();
        assert_eq!(lb.min(), 1);

        lb.handle_done(&client(0));
        assert_eq!(lb.count_of(&b.addr), Some(0));
        assert_eq!(lb.min(), 1);
    }

    #[test]
    fn duplicate_addresses_collapse() {
        let pool = vec![
            Arc::new(Backend::new("127.0.0.1:9000")),
            Arc::new(Backend::new("127.0.0.1:9000")),
        ];
        let lb = LeastConn::new(pool);
        assert_eq!(lb.stats(), "backends: {127.0.0.1:9000: 0}, active: 0, min: 0");
    }

    #[test]
    fn concurrent_selection_and_completion_balance_out() {
        let pool = backends(4);
        let lb = Arc::new(LeastConn::new(pool.clone()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let lb = lb.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let ctx = ConnectionContext::new(
                            format!("10.0.{t}.1:{}", 10000 + i).parse().unwrap(),
                        );
                        lb.next_backend(&ctx).unwrap();
                        lb.handle_done(&ctx);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(lb.in_flight(), 0);
        for b in &pool {
            assert_eq!(lb.count_of(&b.addr), Some(0));
        }
    }

    #[test]
    fn empty_pool_has_no_backend() {
        let lb = LeastConn::new(Vec::new());
        assert_eq!(lb.next_backend(&client(0)).unwrap_err(), BalancerError::NoBackend);
    }
}
