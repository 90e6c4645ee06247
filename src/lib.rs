//! TCP/UDP load balancer library.
//!
//! Each configured listener becomes a [`proxy::Proxy`] that accepts TCP
//! connections (optionally terminating TLS) or UDP datagrams and forwards
//! them to a backend picked by a pluggable [`load_balancer::LoadBalancer`].
//! The [`lifecycle::Manager`] owns the set of proxies and handles hot
//! reload, graceful stop and forced stop.

pub mod config;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::{Config, ConfigSource, ListenerSpec, Protocol};
pub use lifecycle::{ControlSignal, Manager, ManagerOptions, Termination};
pub use proxy::{Proxy, ProxyOptions};
