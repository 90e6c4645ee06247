//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Reject unknown balancing strategies and empty backend lists
//! - Check address shapes and TLS pairing
//! - Detect listeners bound twice
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::{Config, ListenerSpec, Protocol};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{listen}: no backends configured")]
    NoBackends { listen: String },
    #[error("{listen}: unsupported balancing strategy '{name}'")]
    UnknownStrategy { listen: String, name: String },
    #[error("{listen}: listen address must be host:port")]
    InvalidListenAddress { listen: String },
    #[error("{listen}: backend address '{address}' must be host:port")]
    InvalidBackendAddress { listen: String, address: String },
    #[error("{listen}: cert_file and key_file must be set together")]
    IncompleteTls { listen: String },
    #[error("{listen}: TLS is only supported for tcp listeners")]
    TlsOverUdp { listen: String },
    #[error("{listen}: max_connections must be greater than zero")]
    ZeroMaxConnections { listen: String },
    #[error("{listen}: {protocol} listener defined more than once")]
    DuplicateListener { listen: String, protocol: Protocol },
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn validate_entry(entry: &ListenerSpec, errors: &mut Vec<ValidationError>) {
    let listen = entry.listen_addr.clone();

    if !is_host_port(&entry.bind_addr()) {
        errors.push(ValidationError::InvalidListenAddress {
            listen: listen.clone(),
        });
    }

    if entry.backends.is_empty() {
        errors.push(ValidationError::NoBackends {
            listen: listen.clone(),
        });
    }
    for address in entry.backend_addrs() {
        if !is_host_port(address) {
            errors.push(ValidationError::InvalidBackendAddress {
                listen: listen.clone(),
                address: address.to_string(),
            });
        }
    }

    if entry.strategy().is_err() {
        errors.push(ValidationError::UnknownStrategy {
            listen: listen.clone(),
            name: entry.strategy.clone(),
        });
    }

    match (&entry.cert_file, &entry.key_file) {
        (Some(_), None) | (None, Some(_)) => {
            errors.push(ValidationError::IncompleteTls {
                listen: listen.clone(),
            });
        }
        (Some(_), Some(_)) if entry.protocol == Protocol::Udp => {
            errors.push(ValidationError::TlsOverUdp {
                listen: listen.clone(),
            });
        }
        _ => {}
    }

    if entry.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections { listen });
    }
}

/// Validate every listener entry and the set as a whole.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for entry in &config.listeners {
        validate_entry(entry, &mut errors);
        if !seen.insert((entry.protocol, entry.bind_addr())) {
            errors.push(ValidationError::DuplicateListener {
                listen: entry.listen_addr.clone(),
                protocol: entry.protocol,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
