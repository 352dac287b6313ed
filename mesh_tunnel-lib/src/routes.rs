use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::provider_link::ProviderLink;

/// Marks tunnel-sourced routes so the backend replaces prior ones atomically
/// instead of accumulating them.
pub const ROUTE_SOURCE: &str = "tunnel";

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error making http request: {0:?}")]
    Request(#[from] reqwest::Error),
    #[error("backend rejected route registration [status: {status}]: {body}")]
    Backend { status: u16, body: String },
    #[error("backend does not speak the routes api: {0}")]
    NotRoutesApi(reqwest::Error),
    #[error("backend url cannot carry a path")]
    CannotBeBase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub priority: u16,
    pub scheme: Scheme,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Where announced routes point and under which policy.
#[derive(Clone, Debug)]
pub struct RouteTarget {
    pub ip: Ipv4Addr,
    pub https_port: u16,
    pub http_port: u16,
    pub priority: u16,
    pub health_check: Option<HealthCheck>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnnounceResponse {
    pub message: Option<String>,
    pub routes: Option<serde_json::Value>,
    pub domain: Option<String>,
    pub error: Option<String>,
}

/// Dual-scheme route list: HTTPS on the announced port, plain HTTP on the
/// configured HTTP port, both pointing at the provider's internal gateway.
pub fn build_routes(target: &RouteTarget) -> Vec<Route> {
    vec![
        Route {
            ip: target.ip,
            port: target.https_port,
            priority: target.priority,
            scheme: Scheme::Https,
            source: ROUTE_SOURCE.to_string(),
            health_check: target.health_check.clone(),
        },
        Route {
            ip: target.ip,
            port: target.http_port,
            priority: target.priority,
            scheme: Scheme::Http,
            source: ROUTE_SOURCE.to_string(),
            health_check: None,
        },
    ]
}

/// Publish the route list to the routing backend.
///
/// A status >= 400 and a non-JSON body are distinct failures: the latter
/// means the backend does not expose this API at all.
pub async fn announce(client: &Client, link: &ProviderLink, routes: &[Route]) -> Result<AnnounceResponse, Error> {
    let mut url = link.backend_url.clone();
    url.path_segments_mut()
        .map_err(|_| Error::CannotBeBase)?
        .pop_if_empty()
        .extend(["router", "api", "routes", &link.user_id, &link.signature]);

    let resp = client
        .post(url)
        .json(&json!({ "routes": routes }))
        .timeout(ANNOUNCE_TIMEOUT)
        .send()
        .await?;

    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Backend {
            status: status.as_u16(),
            body,
        });
    }

    resp.json::<AnnounceResponse>().await.map_err(Error::NotRoutesApi)
}

/// Re-announce on a fixed cadence until cancelled. Tick failures are logged;
/// a backend outage must not tear down the tunnel.
pub fn spawn_refresh_loop(
    client: Client,
    link: ProviderLink,
    routes: Vec<Route>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the interval fires immediately; the initial announce already happened
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(provider = %link.backend_url, "route refresh loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    match announce(&client, &link, &routes).await {
                        Ok(_) => tracing::debug!(provider = %link.backend_url, "refreshed route registration"),
                        Err(e) => tracing::warn!(error = %e, provider = %link.backend_url, "route refresh failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RouteTarget {
        RouteTarget {
            ip: "192.168.1.5".parse().expect("ip"),
            https_port: 443,
            http_port: 80,
            priority: 2,
            health_check: None,
        }
    }

    #[test]
    fn builds_dual_scheme_route_list() {
        let routes = build_routes(&target());

        assert_eq!(routes.len(), 2);
        assert_eq!(
            (routes[0].ip, routes[0].port, routes[0].scheme),
            ("192.168.1.5".parse().expect("ip"), 443, Scheme::Https)
        );
        assert_eq!(
            (routes[1].ip, routes[1].port, routes[1].scheme),
            ("192.168.1.5".parse().expect("ip"), 80, Scheme::Http)
        );
        assert!(routes.iter().all(|route| route.source == ROUTE_SOURCE));
        assert!(routes.iter().all(|route| route.priority == 2));
    }

    #[test]
    fn health_check_rides_on_the_https_route_only() {
        let mut target = target();
        target.health_check = Some(HealthCheck {
            path: "/healthz".to_string(),
            host: Some("app.example.com".to_string()),
        });

        let routes = build_routes(&target);
        assert!(routes[0].health_check.is_some());
        assert!(routes[1].health_check.is_none());
    }

    #[test]
    fn routes_serialize_to_the_wire_format() -> anyhow::Result<()> {
        let routes = build_routes(&target());
        let json = serde_json::to_value(&routes)?;
        assert_eq!(
            json,
            serde_json::json!([
                {"ip": "192.168.1.5", "port": 443, "priority": 2, "scheme": "https", "source": "tunnel"},
                {"ip": "192.168.1.5", "port": 80, "priority": 2, "scheme": "http", "source": "tunnel"},
            ])
        );

        Ok(())
    }
}
