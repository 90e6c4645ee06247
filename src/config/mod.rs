//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file or URL (JSON/TOML)
//!     → loader.rs (fetch, digest & deserialize)
//!     → validation.rs (semantic checks)
//!     → Config (validated, immutable)
//!     → Manager builds one Proxy per listener entry
//!
//! On change:
//!     watcher.rs detects a new digest
//!     → ControlSignal::Reload on the manager's channel
//!     → Manager stops, reloads and restarts every proxy
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields but the listen address and backends have defaults
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError, ConfigSource, LoadedConfig};
pub use schema::{BackendConfig, Config, ListenerSpec, Protocol};
pub use validation::{validate_config, ValidationError};
