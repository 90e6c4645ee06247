//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (manager.rs):
//!     Load config → Validate → Build proxies → Bind → Serve
//!
//! Control (signals.rs → manager.rs):
//!     SIGHUP / config change → Reload: stop all → load → build → run all
//!     SIGTERM/SIGINT         → Terminate: stop all → Graceful
//!     second SIGTERM/SIGINT  → Forced
//! ```
//!
//! # Design Decisions
//! - Bind failure is fatal, at startup and after a reload
//! - Config errors on reload keep the running generation
//! - Repeated terminate forces exit when connections refuse to drain

pub mod manager;
pub mod signals;

pub use manager::{Manager, ManagerError, ManagerOptions, Termination};
pub use signals::ControlSignal;
