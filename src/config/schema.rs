//! Configuration schema definitions.
//!
//! A configuration is an ordered list of listener entries. Field aliases
//! accept the PascalCase names of the JSON format (`ListenAddr`, `Type`,
//! `Timeout`, `Backends[].Addr`, `Backend`, `CertFile`, `KeyFile`).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load_balancer::{Strategy, UnknownStrategy};

/// Dial timeout used when an entry leaves it unset or zero.
pub const DEFAULT_TIMEOUT_SECS: u64 = 2;

/// Default per-listener connection limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Root configuration: one generation of listeners.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "Entries", alias = "entries")]
    pub listeners: Vec<ListenerSpec>,
}

/// Transport protocol of a listener.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// One listener entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ListenerSpec {
    /// Address to listen on (e.g., "0.0.0.0:8080").
    #[serde(alias = "ListenAddr")]
    pub listen_addr: String,

    /// Transport protocol (default: tcp).
    #[serde(alias = "Type", default)]
    pub protocol: Protocol,

    /// Backend dial timeout in seconds (default: 2, zero means default).
    #[serde(alias = "Timeout", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Backends traffic is balanced across.
    #[serde(alias = "Backends", default)]
    pub backends: Vec<BackendConfig>,

    /// Balancing strategy name (default: RoundRobin).
    #[serde(alias = "Backend", default = "default_strategy")]
    pub strategy: String,

    /// PEM certificate chain; TLS is terminated when set with `key_file`.
    #[serde(alias = "CertFile", default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    /// PEM private key.
    #[serde(alias = "KeyFile", default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// Maximum concurrent connections (or in-flight UDP datagrams).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Free-form operator note.
    #[serde(alias = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Backend address (e.g., "127.0.0.1:3000").
    #[serde(alias = "Addr")]
    pub address: String,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_strategy() -> String {
    Strategy::RoundRobin.as_str().to_string()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl ListenerSpec {
    /// Entry with defaults for everything but the address and backends.
    pub fn new<I, S>(listen_addr: impl Into<String>, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            listen_addr: listen_addr.into(),
            protocol: Protocol::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            backends: backends
                .into_iter()
                .map(|address| BackendConfig {
                    address: address.into(),
                })
                .collect(),
            strategy: default_strategy(),
            cert_file: None,
            key_file: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            comment: None,
        }
    }

    /// Address to bind. A bare `:port` binds all IPv4 interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Dial timeout, applying the default for zero.
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout_secs
        };
        Duration::from_secs(secs)
    }

    /// Parsed balancing strategy.
    pub fn strategy(&self) -> Result<Strategy, UnknownStrategy> {
        self.strategy.parse()
    }

    /// Certificate and key paths when both are configured.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// Backend addresses in configuration order.
    pub fn backend_addrs(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.address.as_str())
    }
}
