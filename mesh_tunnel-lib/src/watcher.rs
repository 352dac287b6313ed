use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::provider_link::ProviderLink;
use crate::tunnel::{self, Driver};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(180);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// What the watcher reports back to the supervisor.
#[derive(Clone, Debug)]
pub enum Alert {
    /// No handshake within the threshold: the tunnel looks dead.
    Stale { link: ProviderLink },
    /// Handshake state could not be read; the watcher keeps going.
    ReadFailed { link: ProviderLink, error: String },
}

#[derive(Clone, Debug)]
struct Entry {
    config_path: PathBuf,
    /// Re-arm point: peers that never completed a handshake are measured
    /// from here instead of epoch 0.
    armed_at: u64,
}

/// Polls per-tunnel handshake timestamps and flags silent tunnels.
pub struct HandshakeWatcher {
    driver: Arc<dyn Driver>,
    threshold: Duration,
    poll_interval: Duration,
    entries: Arc<Mutex<HashMap<ProviderLink, Entry>>>,
    alerts: mpsc::Sender<Alert>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl HandshakeWatcher {
    pub fn new(
        driver: Arc<dyn Driver>,
        threshold: Duration,
        poll_interval: Duration,
    ) -> (Self, mpsc::Receiver<Alert>) {
        let (alerts, alerts_rx) = mpsc::channel(16);
        (
            HandshakeWatcher {
                driver,
                threshold,
                poll_interval,
                entries: Arc::new(Mutex::new(HashMap::new())),
                alerts,
                task: None,
            },
            alerts_rx,
        )
    }

    /// Watch the tunnel behind `config_path` for this provider. Re-adding an
    /// already watched provider re-arms its grace period.
    pub fn add(&self, link: ProviderLink, config_path: PathBuf) {
        let mut entries = self.entries.lock().expect("watcher lock");
        entries.insert(
            link,
            Entry {
                config_path,
                armed_at: epoch_secs(),
            },
        );
    }

    pub fn remove(&self, link: &ProviderLink) {
        let mut entries = self.entries.lock().expect("watcher lock");
        entries.remove(link);
    }

    pub fn is_watching(&self) -> bool {
        self.task.is_some()
    }

    pub fn start_watching(&mut self) {
        if self.task.is_some() {
            return;
        }
        tracing::debug!("starting handshake watcher");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            self.driver.clone(),
            self.entries.clone(),
            self.threshold,
            self.poll_interval,
            self.alerts.clone(),
            cancel.clone(),
        ));
        self.task = Some((cancel, handle));
    }

    pub fn stop_watching(&mut self) {
        if let Some((cancel, _handle)) = self.task.take() {
            tracing::debug!("stopping handshake watcher");
            cancel.cancel();
        }
    }

    pub fn close(&mut self) {
        self.stop_watching();
    }
}

async fn poll_loop(
    driver: Arc<dyn Driver>,
    entries: Arc<Mutex<HashMap<ProviderLink, Entry>>>,
    threshold: Duration,
    poll_interval: Duration,
    alerts: mpsc::Sender<Alert>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshot: Vec<(ProviderLink, Entry)> = {
            let entries = entries.lock().expect("watcher lock");
            entries.iter().map(|(link, entry)| (link.clone(), entry.clone())).collect()
        };
        let now = epoch_secs();

        for (link, entry) in snapshot {
            let Some(interface) = tunnel::interface_name(&entry.config_path) else {
                continue;
            };
            match driver.latest_handshakes(interface) {
                Ok(handshakes) => {
                    let stale = handshakes
                        .values()
                        .any(|last| is_stale(*last, entry.armed_at, now, threshold));
                    if stale {
                        tracing::warn!(provider = %link.backend_url, "tunnel handshake went stale");
                        // re-arm so a slow restart does not alert every tick
                        if let Some(entry) = entries.lock().expect("watcher lock").get_mut(&link) {
                            entry.armed_at = now;
                        }
                        let _ = alerts.send(Alert::Stale { link }).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(provider = %link.backend_url, error = %e, "failed reading handshake state");
                    let _ = alerts
                        .send(Alert::ReadFailed {
                            link,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }
}

/// A peer is stale when its last handshake is older than the threshold;
/// peers that never completed one (epoch 0) are measured from the moment
/// they were armed.
fn is_stale(last_handshake: u64, armed_at: u64, now: u64, threshold: Duration) -> bool {
    let reference = if last_handshake == 0 { armed_at } else { last_handshake };
    now.saturating_sub(reference) > threshold.as_secs()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::mock::MockDriver;
    use rstest::rstest;

    #[rstest]
    #[case(1000, 0, 1100, 60, true)] // old handshake
    #[case(1000, 0, 1030, 60, false)] // recent handshake
    #[case(0, 1000, 1100, 60, true)] // never handshaked, grace expired
    #[case(0, 1090, 1100, 60, false)] // never handshaked, inside grace
    #[case(1100, 0, 1000, 60, false)] // clock skew does not underflow
    fn staleness_rule(
        #[case] last: u64,
        #[case] armed: u64,
        #[case] now: u64,
        #[case] threshold_secs: u64,
        #[case] expected: bool,
    ) {
        assert_eq!(is_stale(last, armed, now, Duration::from_secs(threshold_secs)), expected);
    }

    fn link() -> ProviderLink {
        "https://provider.example.com,alice,sig".parse().expect("link")
    }

    #[tokio::test]
    async fn stale_tunnel_raises_an_alert() -> anyhow::Result<()> {
        let driver = Arc::new(MockDriver::default());
        driver.set_handshake("server-pub", epoch_secs() - 600);

        let (mut watcher, mut alerts) =
            HandshakeWatcher::new(driver, Duration::from_secs(60), Duration::from_millis(10));
        watcher.add(link(), PathBuf::from("/tmp/mt0a1b2c3d.conf"));
        watcher.start_watching();

        let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv()).await?;
        match alert {
            Some(Alert::Stale { link: alerted }) => assert_eq!(alerted, link()),
            other => panic!("unexpected alert: {other:?}"),
        }

        watcher.close();

        Ok(())
    }

    #[tokio::test]
    async fn live_tunnel_stays_quiet() -> anyhow::Result<()> {
        let driver = Arc::new(MockDriver::default());
        driver.set_handshake("server-pub", epoch_secs());

        let (mut watcher, mut alerts) =
            HandshakeWatcher::new(driver, Duration::from_secs(60), Duration::from_millis(10));
        watcher.add(link(), PathBuf::from("/tmp/mt0a1b2c3d.conf"));
        watcher.start_watching();

        let alert = tokio::time::timeout(Duration::from_millis(100), alerts.recv()).await;
        assert!(alert.is_err(), "no alert expected for a live tunnel");

        watcher.close();

        Ok(())
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let driver = Arc::new(MockDriver::default());
        let (mut watcher, _alerts) =
            HandshakeWatcher::new(driver, DEFAULT_THRESHOLD, DEFAULT_POLL_INTERVAL);

        watcher.start_watching();
        watcher.start_watching();
        assert!(watcher.is_watching());
        watcher.stop_watching();
        watcher.stop_watching();
        assert!(!watcher.is_watching());
    }

    #[tokio::test]
    async fn removed_provider_is_no_longer_polled() -> anyhow::Result<()> {
        let driver = Arc::new(MockDriver::default());
        driver.set_handshake("server-pub", epoch_secs() - 600);

        let (mut watcher, mut alerts) =
            HandshakeWatcher::new(driver, Duration::from_secs(60), Duration::from_millis(10));
        watcher.add(link(), PathBuf::from("/tmp/mt0a1b2c3d.conf"));
        watcher.remove(&link());
        watcher.start_watching();

        let alert = tokio::time::timeout(Duration::from_millis(100), alerts.recv()).await;
        assert!(alert.is_err(), "removed provider must not alert");

        watcher.close();

        Ok(())
    }
}
