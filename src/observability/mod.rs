//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (listen, peer_addr,
//!       connection_id, backend, error)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, text or JSON)
//!     → Manager::snapshot / log_stats for balancer state
//! ```

pub mod logging;
