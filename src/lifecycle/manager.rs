//! Process-level lifecycle manager.
//!
//! # Responsibilities
//! - Load configuration and build one [`Proxy`] per listener entry
//! - Run, stop and reload the whole generation of proxies
//! - Dispatch [`ControlSignal`]s: reload, graceful stop, forced stop
//! - Start configuration change detection
//!
//! # Design Decisions
//! - Reload is stop-the-world: every proxy of the old generation is stopped
//!   before the new one binds, so listeners can move between generations on
//!   the same address
//! - A new configuration is loaded and built before anything is stopped; a
//!   broken configuration leaves the running generation untouched
//! - Reload and stop are serialized by an async lock, while signal dispatch
//!   never blocks so a second terminate is always seen

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use notify::RecommendedWatcher;
use tokio::sync::{mpsc, watch};

use crate::config::watcher::{ConfigPoller, ConfigWatcher, DEFAULT_POLL_INTERVAL};
use crate::config::{load_config, Config, ConfigError, ConfigSource};
use crate::lifecycle::signals::ControlSignal;
use crate::proxy::{Proxy, ProxyError, ProxyOptions, ProxySnapshot};

/// How the manager finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// All proxies stopped after a terminate request.
    Graceful,
    /// A second terminate arrived while stopping.
    Forced,
    /// A reload stopped the old generation but the new one could not start.
    Failed(String),
}

/// Error type for manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("manager is stopping")]
    Stopping,
}

/// Manager tunables.
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub proxy: ProxyOptions,
    /// Interval for polling the configuration source. URL sources are always
    /// polled, with [`DEFAULT_POLL_INTERVAL`] when unset.
    pub poll_interval: Option<Duration>,
    /// Watch a local configuration file for changes.
    pub watch_file: bool,
}

/// One configuration generation: the proxies built from it.
#[derive(Debug, Default)]
struct Generation {
    proxies: Vec<Arc<Proxy>>,
}

/// Owns the running generation of proxies and its control channel.
pub struct Manager {
    source: ConfigSource,
    options: ManagerOptions,
    generation: ArcSwap<Generation>,
    lifecycle: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
    signals_tx: mpsc::UnboundedSender<ControlSignal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlSignal>>>,
    digest_tx: watch::Sender<String>,
    done_tx: watch::Sender<Option<Termination>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Manager {
    pub fn new(source: ConfigSource, options: ManagerOptions) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (digest_tx, _) = watch::channel(String::new());
        let (done_tx, _) = watch::channel(None);

        Arc::new(Self {
            source,
            options,
            generation: ArcSwap::from_pointee(Generation::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            stopping: AtomicBool::new(false),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
            digest_tx,
            done_tx,
            watcher: Mutex::new(None),
        })
    }

    /// Sender for injecting control signals (OS signals, config watchers).
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<ControlSignal> {
        self.signals_tx.clone()
    }

    /// Digest of the configuration the running generation was built from.
    pub fn config_digest(&self) -> String {
        self.digest_tx.borrow().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Proxies of the running generation.
    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.generation.load().proxies.clone()
    }

    fn build(&self, config: &Config) -> Result<Vec<Arc<Proxy>>, ProxyError> {
        config
            .listeners
            .iter()
            .map(|spec| Proxy::new(spec.clone(), self.options.proxy).map(Arc::new))
            .collect()
    }

    /// Load the configuration, start every proxy, then begin dispatching
    /// control signals and watching for configuration changes.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;

        let loaded = load_config(&self.source).await?;
        if loaded.config.listeners.is_empty() {
            tracing::warn!(source = %self.source, "Configuration has no listeners");
        }
        let proxies = self.build(&loaded.config)?;
        self.generation.store(Arc::new(Generation { proxies }));
        self.digest_tx.send_replace(loaded.digest);

        self.run_all().await?;
        self.spawn_dispatcher();
        self.spawn_change_detection();

        tracing::info!(
            source = %self.source,
            listeners = loaded.config.listeners.len(),
            "Manager started"
        );
        self.log_stats();
        Ok(())
    }

    /// Bind and serve every proxy of the current generation, each in its own
    /// task. A bind failure closes the whole generation and is returned.
    pub async fn run_all(&self) -> Result<(), ManagerError> {
        let generation = self.generation.load_full();

        for proxy in &generation.proxies {
            let listener = match proxy.bind().await {
                Ok(listener) => listener,
                Err(e) => {
                    for proxy in &generation.proxies {
                        proxy.close();
                    }
                    return Err(e.into());
                }
            };
            let proxy = proxy.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.serve(listener).await {
                    tracing::error!(listen = %proxy.listen_addr(), error = %e, "Proxy failed");
                }
            });
        }
        Ok(())
    }

    /// Close every proxy and wait until all of them report stopped.
    pub async fn stop_all(&self) {
        let generation = self.generation.load_full();
        for proxy in &generation.proxies {
            tracing::info!(listen = %proxy.listen_addr(), protocol = %proxy.protocol(), "Stopping proxy");
            proxy.close();
        }
        join_all(generation.proxies.iter().map(|p| p.wait_stopped())).await;
        tracing::debug!(proxies = generation.proxies.len(), "All proxies stopped");
    }

    /// Replace the running generation with one built from freshly loaded
    /// configuration.
    ///
    /// Load and build errors keep the current generation running. A bind
    /// failure of the new generation is fatal: the manager terminates with
    /// [`Termination::Failed`].
    pub async fn reload(&self) -> Result<(), ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_stopping() {
            return Err(ManagerError::Stopping);
        }

        tracing::info!(source = %self.source, "Reloading configuration");
        let loaded = match load_config(&self.source).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(error = %e, "Reload failed, keeping current configuration");
                return Err(e.into());
            }
        };
        let proxies = match self.build(&loaded.config) {
            Ok(proxies) => proxies,
            Err(e) => {
                tracing::error!(error = %e, "Reload failed, keeping current configuration");
                return Err(e.into());
            }
        };

        self.stop_all().await;
        self.generation.store(Arc::new(Generation { proxies }));
        self.digest_tx.send_replace(loaded.digest);

        if let Err(e) = self.run_all().await {
            tracing::error!(error = %e, "New configuration failed to start");
            self.finish(Termination::Failed(e.to_string()));
            return Err(e);
        }

        tracing::info!(listeners = loaded.config.listeners.len(), "Configuration reloaded");
        self.log_stats();
        Ok(())
    }

    /// React to a control signal. Never blocks: reload and stop run in
    /// background tasks.
    pub fn handle(self: &Arc<Self>, signal: ControlSignal) {
        match signal {
            ControlSignal::Reload => {
                if self.is_stopping() {
                    tracing::info!("Ignoring reload while stopping");
                    return;
                }
                let manager = self.clone();
                tokio::spawn(async move {
                    let _ = manager.reload().await;
                });
            }
            ControlSignal::Terminate => {
                if self.stopping.swap(true, Ordering::SeqCst) {
                    tracing::warn!(pid = std::process::id(), "Forcing stop");
                    self.finish(Termination::Forced);
                    return;
                }
                tracing::info!(pid = std::process::id(), "Attempting to stop");
                let manager = self.clone();
                tokio::spawn(async move {
                    let _lifecycle = manager.lifecycle.lock().await;
                    manager.stop_all().await;
                    manager.finish(Termination::Graceful);
                });
            }
        }
    }

    fn finish(&self, termination: Termination) {
        self.done_tx.send_if_modified(|done| {
            if done.is_none() {
                *done = Some(termination);
                true
            } else {
                false
            }
        });
    }

    /// Wait until the manager terminates.
    pub async fn wait(&self) -> Termination {
        let mut done = self.done_tx.subscribe();
        let termination = match done.wait_for(Option::is_some).await {
            Ok(termination) => termination.clone().unwrap_or(Termination::Graceful),
            Err(_) => Termination::Graceful,
        };
        termination
    }

    fn spawn_dispatcher(self: &Arc<Self>) {
        let Some(mut rx) = self
            .signals_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle(signal);
            }
        });
    }

    fn spawn_change_detection(&self) {
        match &self.source {
            ConfigSource::Url(_) => {
                let interval = self.options.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
                ConfigPoller::new(
                    self.source.clone(),
                    interval,
                    self.digest_tx.subscribe(),
                    self.signal_sender(),
                )
                .spawn();
            }
            ConfigSource::File(path) => {
                if let Some(interval) = self.options.poll_interval {
                    ConfigPoller::new(
                        self.source.clone(),
                        interval,
                        self.digest_tx.subscribe(),
                        self.signal_sender(),
                    )
                    .spawn();
                }
                if self.options.watch_file {
                    match ConfigWatcher::new(path, self.digest_tx.subscribe(), self.signal_sender()).run() {
                        Ok(watcher) => {
                            *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
                        }
                        Err(e) => {
                            tracing::error!(path = ?path, error = %e, "Failed to watch config file");
                        }
                    }
                }
            }
        }
    }

    /// Per-proxy status, sorted by protocol then listen address.
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let mut snapshots: Vec<ProxySnapshot> = self
            .generation
            .load()
            .proxies
            .iter()
            .map(|p| p.snapshot())
            .collect();
        snapshots.sort_by(|a, b| {
            (a.protocol.to_string(), &a.listen_addr).cmp(&(b.protocol.to_string(), &b.listen_addr))
        });
        snapshots
    }

    /// Log one line per proxy with its balancer state.
    pub fn log_stats(&self) {
        for snapshot in self.snapshot() {
            tracing::info!(
                listen = %snapshot.listen_addr,
                protocol = %snapshot.protocol,
                strategy = snapshot.strategy,
                tls = snapshot.tls,
                active_connections = snapshot.active_connections,
                stats = %snapshot.stats,
                "Proxy stats"
            );
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("source", &self.source)
            .field("stopping", &self.is_stopping())
            .field("proxies", &self.generation.load().proxies.len())
            .finish()
    }
}
