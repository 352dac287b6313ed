use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::key_store::KeyStore;
use crate::provider_link::{self, ProviderLink};
use crate::tunnel::Driver;
use crate::watcher::{Alert, HandshakeWatcher};

pub mod runner;

use runner::{Context, Outcome};

/// Distinctive exit code for an unrecoverable provider start failure; a
/// process restart re-reads the declarative config and retries from scratch.
pub const EXIT_START_FAILURE: i32 = 51;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Where per-provider tunnel configs and key pairs live.
    pub state_dir: PathBuf,
    /// Fallback route target when a register response carries no routeIp.
    pub target_host: Option<Ipv4Addr>,
    pub target_port_http: u16,
    pub target_port_https: u16,
    pub route_priority: u16,
    pub route_refresh_interval: Duration,
    pub provider_retry_interval: Duration,
    pub ping_retry_interval: Duration,
    pub handshake_threshold: Duration,
    pub handshake_poll_interval: Duration,
    pub health_check_path: Option<String>,
    pub health_check_host: Option<String>,
}

struct ActiveProvider {
    cancel: CancellationToken,
    config_path: PathBuf,
}

/// Multi-provider supervision: holds the declaratively configured provider
/// set, reconciles it against the running flows, and restarts a flow when
/// its tunnel goes silent.
pub struct Supervisor {
    context: Context,
    active: HashMap<ProviderLink, ActiveProvider>,
    watcher: HandshakeWatcher,
    alerts_rx: Option<mpsc::Receiver<Alert>>,
    outcomes_tx: mpsc::Sender<Outcome>,
    outcomes_rx: Option<mpsc::Receiver<Outcome>>,
}

impl Supervisor {
    pub fn new(settings: Settings, driver: Arc<dyn Driver>) -> Self {
        let key_store = KeyStore::new(settings.state_dir.clone());
        let (watcher, alerts_rx) = HandshakeWatcher::new(
            driver.clone(),
            settings.handshake_threshold,
            settings.handshake_poll_interval,
        );
        let (outcomes_tx, outcomes_rx) = mpsc::channel(16);
        Supervisor {
            context: Context {
                settings,
                driver,
                key_store,
                client: reqwest::Client::new(),
            },
            active: HashMap::new(),
            watcher,
            alerts_rx: Some(alerts_rx),
            outcomes_tx,
            outcomes_rx: Some(outcomes_rx),
        }
    }

    /// Drive the supervisor until shutdown. Returns the process exit code.
    pub async fn run(
        mut self,
        initial_config: Config,
        mut config_rx: mpsc::Receiver<Config>,
        shutdown: CancellationToken,
    ) -> i32 {
        let mut alerts_rx = self.alerts_rx.take().expect("run consumes the alert receiver");
        let mut outcomes_rx = self.outcomes_rx.take().expect("run consumes the outcome receiver");

        if let Err(e) = self.reconcile(&initial_config) {
            tracing::error!(error = %e, "invalid provider configuration");
            return EXIT_START_FAILURE;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shutdown();
                    return exitcode::OK;
                }
                Some(config) = config_rx.recv() => {
                    tracing::info!("configuration changed, reconciling providers");
                    if let Err(e) = self.reconcile(&config) {
                        tracing::error!(error = %e, "invalid provider configuration");
                        return EXIT_START_FAILURE;
                    }
                }
                Some(outcome) = outcomes_rx.recv() => {
                    match outcome {
                        Outcome::Started { link, config_path } => self.note_started(link, config_path),
                        Outcome::Failed { link, error } => {
                            if self.active.contains_key(&link) {
                                tracing::error!(provider = %link.backend_url, error = %error, "provider start failed");
                                return EXIT_START_FAILURE;
                            }
                            // the flow was stopped while starting; nothing to do
                        }
                    }
                }
                Some(alert) = alerts_rx.recv() => self.handle_alert(alert),
            }
        }
    }

    /// Apply a new declarative config: stops before starts, so a provider
    /// that disappears and reappears in one delta starts from a clean slate.
    pub fn reconcile(&mut self, config: &Config) -> Result<(), provider_link::Error> {
        let desired: HashSet<ProviderLink> = config.links()?.into_iter().collect();
        let current: HashSet<ProviderLink> = self.active.keys().cloned().collect();

        let to_stop: Vec<ProviderLink> = current.difference(&desired).cloned().collect();
        for link in to_stop {
            self.stop_requester(&link);
        }
        for link in desired {
            if !self.active.contains_key(&link) {
                self.start_requester(link);
            }
        }
        self.sync_watcher_task();
        Ok(())
    }

    pub fn active_links(&self) -> Vec<ProviderLink> {
        self.active.keys().cloned().collect()
    }

    pub fn watching(&self) -> bool {
        self.watcher.is_watching()
    }

    fn start_requester(&mut self, link: ProviderLink) {
        tracing::info!(provider = %link.backend_url, user = %link.user_id, "starting provider flow");
        let cancel = CancellationToken::new();
        let config_path = self.context.config_path(&link);
        self.active.insert(
            link.clone(),
            ActiveProvider {
                cancel: cancel.clone(),
                config_path,
            },
        );
        tokio::spawn(runner::start_provider(
            self.context.clone(),
            link,
            cancel,
            self.outcomes_tx.clone(),
        ));
    }

    /// Cancel the flow, bring its interface down best-effort and delete the
    /// tunnel config. Non-fatal errors are logged and swallowed.
    fn stop_requester(&mut self, link: &ProviderLink) {
        let Some(active) = self.active.remove(link) else {
            return;
        };
        tracing::info!(provider = %link.backend_url, "stopping provider flow");
        active.cancel.cancel();
        self.watcher.remove(link);

        if let Err(e) = self.context.driver.interface_down(&active.config_path) {
            tracing::debug!(provider = %link.backend_url, error = %e, "interface down during stop");
        }
        match fs::remove_file(&active.config_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(provider = %link.backend_url, error = %e, "failed deleting tunnel config"),
        }
    }

    fn note_started(&mut self, link: ProviderLink, config_path: PathBuf) {
        if !self.active.contains_key(&link) {
            // stopped while the runner was still starting
            return;
        }
        tracing::info!(provider = %link.backend_url, "provider flow established");
        self.watcher.add(link, config_path);
    }

    fn handle_alert(&mut self, alert: Alert) {
        match alert {
            Alert::Stale { link } => {
                if !self.active.contains_key(&link) {
                    return;
                }
                tracing::warn!(provider = %link.backend_url, "restarting provider flow after tunnel liveness loss");
                self.stop_requester(&link);
                self.start_requester(link);
                self.sync_watcher_task();
            }
            Alert::ReadFailed { link, error } => {
                tracing::warn!(provider = %link.backend_url, %error, "handshake read failed");
            }
        }
    }

    fn sync_watcher_task(&mut self) {
        if self.active.is_empty() {
            self.watcher.stop_watching();
        } else {
            self.watcher.start_watching();
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("shutting down all provider flows");
        let links: Vec<ProviderLink> = self.active.keys().cloned().collect();
        for link in links {
            self.stop_requester(&link);
        }
        self.watcher.close();
    }
}
