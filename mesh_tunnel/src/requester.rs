use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mesh_tunnel_lib::config::{self, Config};
use mesh_tunnel_lib::dirs;
use mesh_tunnel_lib::supervisor::{Settings, Supervisor};
use mesh_tunnel_lib::tunnel::{self, Tooling};

use crate::cli::RequesterArgs;

// handling fs config events with a grace period to avoid reading half-written files
const CONFIG_GRACE_PERIOD: Duration = Duration::from_millis(333);

pub async fn run(args: RequesterArgs) -> exitcode::ExitCode {
    if let Err(e) = tunnel::available() {
        tracing::error!(error = %e, "wireguard toolchain not usable");
        return exitcode::UNAVAILABLE;
    }

    let state_dir = match args.state_dir.clone() {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::error!(error = %e, dir = %dir.display(), "cannot create state directory");
                return exitcode::CANTCREAT;
            }
            dir
        }
        None => match dirs::state_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, "cannot determine state directory");
                return exitcode::CANTCREAT;
            }
        },
    };

    let initial_config = match config::read(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = ?e, config_file = %args.config_path.display(), "cannot read configuration file");
            return exitcode::NOINPUT;
        }
    };

    let (config_tx, config_rx) = mpsc::channel(4);
    // keep the watcher in scope so it does not get dropped
    let _config_watcher = match watch_config(&args.config_path, config_tx) {
        Ok(watcher) => watcher,
        Err(exit) => return exit,
    };

    let settings = Settings {
        state_dir,
        target_host: args.target_host,
        target_port_http: args.target_port_http,
        target_port_https: args.target_port_https,
        route_priority: args.route_priority,
        route_refresh_interval: args.route_refresh_interval,
        provider_retry_interval: args.provider_retry_interval,
        ping_retry_interval: args.ping_retry_interval,
        handshake_threshold: args.handshake_threshold,
        handshake_poll_interval: args.handshake_poll_interval,
        health_check_path: args.health_check_path,
        health_check_host: args.health_check_host,
    };
    let supervisor = Supervisor::new(settings, Arc::new(Tooling::new()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed installing signal handler");
            }
            tracing::info!("initiate shutdown");
            shutdown.cancel();
        });
    }

    tracing::info!(providers = initial_config.providers.len(), "enter supervision mode");
    supervisor.run(initial_config, config_rx, shutdown).await
}

/// Watch the declarative config file and push re-read configs to the
/// supervisor. Unreadable updates are logged; the current config stays.
fn watch_config(
    config_path: &Path,
    sender: mpsc::Sender<Config>,
) -> Result<notify::RecommendedWatcher, exitcode::ExitCode> {
    let config_path = match std::fs::canonicalize(config_path) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = %e, "error canonicalizing config path");
            return Err(exitcode::IOERR);
        }
    };
    let parent = match config_path.parent() {
        Some(dir) => dir.to_path_buf(),
        None => {
            tracing::error!("config path has no parent");
            return Err(exitcode::UNAVAILABLE);
        }
    };

    let (event_tx, mut event_rx) = mpsc::channel::<()>(4);
    let watch_target = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            let relevant = (event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove())
                && event.paths.iter().any(|path| path == &watch_target);
            if relevant {
                let _ = event_tx.blocking_send(());
            }
        }
        Err(e) => tracing::error!(error = %e, "error watching config directory"),
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = %e, "error creating config watcher");
            return Err(exitcode::IOERR);
        }
    };
    if let Err(e) = watcher.watch(&parent, RecursiveMode::NonRecursive) {
        tracing::error!(error = %e, "error watching config directory");
        return Err(exitcode::IOERR);
    }

    tokio::spawn(async move {
        while event_rx.recv().await.is_some() {
            tokio::time::sleep(CONFIG_GRACE_PERIOD).await;
            // collapse the event burst a single write produces
            while event_rx.try_recv().is_ok() {}
            match config::read(&config_path).await {
                Ok(config) => {
                    if sender.send(config).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "failed to update configuration - staying on current configuration");
                }
            }
        }
    });

    Ok(watcher)
}
