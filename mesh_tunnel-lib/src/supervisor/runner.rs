//! Per-provider start flow, spawned by the supervisor. Runners report their
//! outcome through a channel and are torn down via cancellation token.

use backoff::ExponentialBackoff;
use backoff::future::retry;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time;
use tokio_util::sync::CancellationToken;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::admission_client::{self, CLIENT_VERSION, REQUIRED_VERSION, RegisterRequest, RegisterResponse};
use crate::dirs;
use crate::key_store::{self, KeyPair, KeyStore};
use crate::ping;
use crate::provider_link::ProviderLink;
use crate::routes::{self, HealthCheck, RouteTarget};
use crate::supervisor::Settings;
use crate::tunnel::{self, Driver};
use crate::wg_config::{self, DeviceConfig, Interface, PeerSection};

/// Everything a runner needs, cheap to clone per provider.
#[derive(Clone)]
pub struct Context {
    pub settings: Settings,
    pub driver: Arc<dyn Driver>,
    pub key_store: KeyStore,
    pub client: reqwest::Client,
}

impl Context {
    pub fn config_path(&self, link: &ProviderLink) -> PathBuf {
        self.settings
            .state_dir
            .join(format!("{}.conf", dirs::provider_slug(&link.backend_url)))
    }
}

pub enum Outcome {
    Started { link: ProviderLink, config_path: PathBuf },
    Failed { link: ProviderLink, error: Error },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("admission api error: {0}")]
    Admission(#[from] admission_client::Error),
    #[error("key store error: {0}")]
    KeyStore(#[from] key_store::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::Error),
    #[error("config file error: {0}")]
    Config(#[from] wg_config::Error),
    #[error("register response carries no interface address")]
    NoAddress,
}

pub async fn start_provider(ctx: Context, link: ProviderLink, cancel: CancellationToken, results: mpsc::Sender<Outcome>) {
    let res = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(provider = %link.backend_url, "provider start cancelled");
            return;
        }
        res = run_start(&ctx, &link, &cancel) => res,
    };
    let outcome = match res {
        Ok(config_path) => Outcome::Started { link, config_path },
        Err(error) => Outcome::Failed { link, error },
    };
    let _ = results.send(outcome).await;
}

async fn run_start(ctx: &Context, link: &ProviderLink, cancel: &CancellationToken) -> Result<PathBuf, Error> {
    wait_available(ctx, link).await?;
    wait_compatible(ctx, link).await?;

    let keys = ctx.key_store.get_or_generate(ctx.driver.as_ref(), &link.backend_url)?;

    let request = RegisterRequest {
        user_id: link.user_id.clone(),
        vpn_public_key: keys.public_key.clone(),
        auth_token: link.signature.clone(),
        client_version: Some(CLIENT_VERSION),
    };
    let reg = admission_client::register(&ctx.client, &link.backend_url, &request).await?;
    tracing::info!(provider = %link.backend_url, domain = %reg.domain, "registered with provider");

    let config_path = ctx.config_path(link);
    let device = device_config(&reg, &keys)?;
    device.store(&config_path)?;

    // down first tolerates leftover state from a previous run
    if let Err(e) = ctx.driver.interface_down(&config_path) {
        tracing::debug!(provider = %link.backend_url, error = %e, "interface was not up before start");
    }
    ctx.driver.interface_up(&config_path)?;

    probe_connectivity(link, reg.server_ip.into()).await;
    announce_routes(ctx, link, &reg, cancel).await;

    Ok(config_path)
}

/// Poll the liveness endpoint until the provider answers. Never gives up on
/// its own; the surrounding select observes the cancellation token.
async fn wait_available(ctx: &Context, link: &ProviderLink) -> Result<(), Error> {
    let strategy = ExponentialBackoff {
        initial_interval: ctx.settings.ping_retry_interval,
        max_interval: ctx.settings.ping_retry_interval,
        multiplier: 1.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    retry(strategy, || async {
        admission_client::ping(&ctx.client, &link.backend_url).await.map_err(|e| {
            tracing::info!(provider = %link.backend_url, error = %e, "provider not reachable yet");
            backoff::Error::transient(e)
        })
    })
    .await?;
    tracing::debug!(provider = %link.backend_url, "provider is reachable");
    Ok(())
}

/// Wait until the provider speaks the dual-scheme route model. An
/// incompatible version backs off on the long migration interval.
async fn wait_compatible(ctx: &Context, link: &ProviderLink) -> Result<(), Error> {
    loop {
        match admission_client::version(&ctx.client, &link.backend_url).await {
            Ok(version) if version >= REQUIRED_VERSION => {
                tracing::debug!(provider = %link.backend_url, version, "provider is compatible");
                return Ok(());
            }
            Ok(version) => {
                tracing::warn!(provider = %link.backend_url, version, "provider api too old, waiting for migration");
                time::sleep(ctx.settings.provider_retry_interval).await;
            }
            Err(e) => {
                tracing::info!(provider = %link.backend_url, error = %e, "provider version probe failed");
                time::sleep(ctx.settings.ping_retry_interval).await;
            }
        }
    }
}

fn device_config(reg: &RegisterResponse, keys: &KeyPair) -> Result<DeviceConfig, Error> {
    let address = reg.wg_config.wg_interface.address.first().ok_or(Error::NoAddress)?.clone();
    Ok(DeviceConfig {
        interface: Interface {
            private_key: keys.private_key.clone(),
            address,
            listen_port: None,
        },
        peers: reg
            .wg_config
            .peers
            .iter()
            .map(|peer| PeerSection {
                name: None,
                public_key: peer.public_key.clone(),
                allowed_ips: peer.allowed_ips.clone(),
                endpoint: Some(peer.endpoint.clone()),
                persistent_keepalive: Some(peer.persistent_keepalive),
            })
            .collect(),
    })
}

/// One-shot ICMP probe through the fresh tunnel; failure is informational.
async fn probe_connectivity(link: &ProviderLink, server_ip: IpAddr) {
    let provider = link.backend_url.clone();
    let probe = task::spawn_blocking(move || ping::ping(&ping::Options::new(server_ip)));
    match probe.await {
        Ok(Ok(rtt)) => tracing::info!(provider = %provider, ?rtt, "tunnel connectivity verified"),
        Ok(Err(e)) => tracing::warn!(provider = %provider, error = %e, "tunnel connectivity probe failed"),
        Err(e) => tracing::warn!(provider = %provider, error = %e, "connectivity probe did not finish"),
    }
}

/// Register routes and start the refresh loop. Route failures are logged:
/// the tunnel still carries traffic, only failover is lost.
async fn announce_routes(ctx: &Context, link: &ProviderLink, reg: &RegisterResponse, cancel: &CancellationToken) {
    let Some(ip) = reg.route_ip.or(ctx.settings.target_host) else {
        tracing::warn!(provider = %link.backend_url, "no route target available, skipping route registration");
        return;
    };
    let target = RouteTarget {
        ip,
        https_port: reg.route_port.unwrap_or(ctx.settings.target_port_https),
        http_port: ctx.settings.target_port_http,
        priority: ctx.settings.route_priority,
        health_check: ctx.settings.health_check_path.clone().map(|path| HealthCheck {
            path,
            host: ctx.settings.health_check_host.clone(),
        }),
    };
    let route_list = routes::build_routes(&target);

    match routes::announce(&ctx.client, link, &route_list).await {
        Ok(resp) => {
            tracing::info!(provider = %link.backend_url, domain = ?resp.domain, "registered tunnel routes");
            routes::spawn_refresh_loop(
                ctx.client.clone(),
                link.clone(),
                route_list,
                ctx.settings.route_refresh_interval,
                cancel.child_token(),
            );
        }
        Err(e) => {
            tracing::warn!(provider = %link.backend_url, error = %e, "route registration failed, tunnel stays up without failover");
        }
    }
}
