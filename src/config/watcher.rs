//! Configuration change detection for hot reload.
//!
//! Two detectors feed the manager's control channel with
//! [`ControlSignal::Reload`]:
//! - [`ConfigPoller`] re-fetches the source on a fixed interval (the only
//!   option for URL sources).
//! - [`ConfigWatcher`] reacts to filesystem events on a local file.
//!
//! Both compare the content digest against the digest of the running
//! generation, published by the manager on a `watch` channel, and signal a
//! given digest at most once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::loader::{digest, ConfigSource};
use crate::lifecycle::signals::ControlSignal;

/// Default interval between polls of a configuration source.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Tracks which digest was last announced so a change is signalled once.
#[derive(Debug)]
struct ChangeGate {
    current: watch::Receiver<String>,
    last_signalled: Option<String>,
}

impl ChangeGate {
    fn new(current: watch::Receiver<String>) -> Self {
        Self {
            current,
            last_signalled: None,
        }
    }

    /// True when `digest` is new and has not been signalled yet.
    fn should_signal(&mut self, digest: String) -> bool {
        if *self.current.borrow() == digest {
            self.last_signalled = None;
            return false;
        }
        if self.last_signalled.as_deref() == Some(digest.as_str()) {
            return false;
        }
        self.last_signalled = Some(digest);
        true
    }
}

/// Periodically re-reads a configuration source.
pub struct ConfigPoller {
    source: ConfigSource,
    interval: Duration,
    gate: ChangeGate,
    signals: mpsc::UnboundedSender<ControlSignal>,
}

impl ConfigPoller {
    pub fn new(
        source: ConfigSource,
        interval: Duration,
        current: watch::Receiver<String>,
        signals: mpsc::UnboundedSender<ControlSignal>,
    ) -> Self {
        Self {
            source,
            interval,
            gate: ChangeGate::new(current),
            signals,
        }
    }

    /// Poll in a background task until the control channel closes.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(
            source = %self.source,
            interval = ?self.interval,
            "Config poller started"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            if self.signals.is_closed() {
                break;
            }

            let content = match self.source.fetch().await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(source = %self.source, error = %e, "Config poll failed");
                    continue;
                }
            };

            if self.gate.should_signal(digest(&content)) {
                tracing::info!(source = %self.source, "Config change detected");
                if self.signals.send(ControlSignal::Reload).is_err() {
                    break;
                }
            }
        }
    }
}

/// Watches a local configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    gate: ChangeGate,
    signals: mpsc::UnboundedSender<ControlSignal>,
}

impl ConfigWatcher {
    pub fn new(
        path: &Path,
        current: watch::Receiver<String>,
        signals: mpsc::UnboundedSender<ControlSignal>,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            gate: ChangeGate::new(current),
            signals,
        }
    }

    /// Start watching. The returned watcher must be kept alive.
    ///
    /// The parent directory is watched so that editors replacing the file
    /// by rename are still noticed.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher {
            path,
            mut gate,
            signals,
        } = self;
        let file_name = path.file_name().map(|n| n.to_os_string());
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let target = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let touches_target = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_target {
                        return;
                    }
                    match std::fs::read(&target) {
                        Ok(content) => {
                            if gate.should_signal(digest(&content)) {
                                tracing::info!(path = ?target, "Config file change detected");
                                let _ = signals.send(ControlSignal::Reload);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(path = ?target, error = %e, "Failed to read changed config file");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
