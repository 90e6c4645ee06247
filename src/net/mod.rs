//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listener entry
//!     → listener.rs (bind TCP/UDP, accept loop, connection limits)
//!     → tls.rs (optional TLS termination material)
//!     → connection.rs (connection id, peer context, in-flight tracking)
//!     → Hand off to the proxy handlers
//! ```
//!
//! # Design Decisions
//! - Bounded accept (semaphore) prevents resource exhaustion
//! - Descriptor exhaustion backs off instead of stopping the listener
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;
