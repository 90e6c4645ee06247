//! Configuration loading from a local file or an HTTP(S) URL.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use url::Url;

use crate::config::schema::{Config, ListenerSpec};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to fetch {url}: {source}")]
    Http { url: Url, source: reqwest::Error },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where configuration is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Url(Url),
}

impl ConfigSource {
    /// `http://` and `https://` locations are URLs, anything else is a path.
    pub fn parse(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => ConfigSource::Url(url),
            _ => ConfigSource::File(PathBuf::from(location)),
        }
    }

    pub fn is_url(&self) -> bool {
        matches!(self, ConfigSource::Url(_))
    }

    /// Read the raw configuration bytes.
    pub async fn fetch(&self) -> Result<Vec<u8>, ConfigError> {
        match self {
            ConfigSource::File(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })
            }
            ConfigSource::Url(url) => {
                let http = |source: reqwest::Error| ConfigError::Http {
                    url: url.clone(),
                    source,
                };
                let response = reqwest::get(url.clone())
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(http)?;
                let body = response.bytes().await.map_err(http)?;
                Ok(body.to_vec())
            }
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Content digest used to detect configuration changes.
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Parse configuration content.
///
/// Content starting with `{` or `[` is JSON: either a bare list of entries
/// or an object with an `Entries`/`listeners` list. Anything else is TOML.
pub fn parse_config(content: &[u8]) -> Result<Config, ConfigError> {
    let text = String::from_utf8_lossy(content);
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        let listeners: Vec<ListenerSpec> = serde_json::from_str(trimmed)?;
        return Ok(Config { listeners });
    }
    if trimmed.starts_with('{') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    Ok(toml::from_str(&text)?)
}

/// A validated configuration and the digest of the content it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub digest: String,
}

/// Fetch, parse and validate configuration.
pub async fn load_config(source: &ConfigSource) -> Result<LoadedConfig, ConfigError> {
    let content = source.fetch().await?;
    let config = parse_config(&content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::debug!(
        source = %source,
        listeners = config.listeners.len(),
        "Configuration loaded"
    );

    Ok(LoadedConfig {
        config,
        digest: digest(&content),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Protocol;

    #[test]
    fn source_detection() {
        assert!(ConfigSource::parse("https://example.com/lb.json").is_url());
        assert!(ConfigSource::parse("http://10.0.0.1:8080/lb").is_url());
        assert_eq!(
            ConfigSource::parse("/etc/tcplb/lb.toml"),
            ConfigSource::File(PathBuf::from("/etc/tcplb/lb.toml"))
        );
        assert!(!ConfigSource::parse("lb.json").is_url());
        assert!(!ConfigSource::parse("ftp://example.com/lb.json").is_url());
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"").len(), 64);
    }

    #[test]
    fn parses_every_format() {
        let json_object = br#"{"Entries": [{"ListenAddr": ":9000", "Backends": [{"Addr": "127.0.0.1:1"}]}]}"#;
        let json_array = br#"[{"listen_addr": ":9000", "backends": [{"address": "127.0.0.1:1"}]}]"#;
        let toml = b"[[listeners]]\nlisten_addr = \":9000\"\nbackends = [{ address = \"127.0.0.1:1\" }]\n";

        for content in [&json_object[..], &json_array[..], &toml[..]] {
            let config = parse_config(content).unwrap();
            assert_eq!(config.listeners.len(), 1);
            assert_eq!(config.listeners[0].listen_addr, ":9000");
            assert_eq!(config.listeners[0].protocol, Protocol::Tcp);
        }
    }

    #[test]
    fn malformed_content_is_an_error() {
        assert!(matches!(parse_config(b"{ not json"), Err(ConfigError::Json(_))));
        assert!(matches!(
            parse_config(b"listeners = 3"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[tokio::test]
    async fn load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(
            &good,
            "[[listeners]]\nlisten_addr = \"127.0.0.1:9000\"\nstrategy = \"LeastConn\"\nbackends = [{ address = \"127.0.0.1:1\" }]\n",
        )
        .unwrap();
        let loaded = load_config(&ConfigSource::File(good)).await.unwrap();
        assert_eq!(loaded.config.listeners.len(), 1);
        assert_eq!(loaded.digest.len(), 64);

        let bad = dir.path().join("bad.toml");
        std::fs::write(
            &bad,
            "[[listeners]]\nlisten_addr = \"127.0.0.1:9000\"\nstrategy = \"Random\"\n",
        )
        .unwrap();
        let err = load_config(&ConfigSource::File(bad)).await.unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        let missing = load_config(&ConfigSource::File(dir.path().join("missing.toml"))).await;
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
