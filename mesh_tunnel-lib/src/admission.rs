use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use std::sync::Arc;
use std::time::Duration;

use crate::admission_client::{RegisterRequest, RegisterResponse, VersionInfo, WgConfig, WgInterface};
use crate::manager::{Settings, VpnManager};
use crate::peer_table::ROOT_PEER_NAME;

/// Revision of the route model this provider speaks (dual scheme).
pub const ROUTER_API_VERSION: u32 = 2;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state behind the admission endpoints. The manager mutex is the
/// single-writer guard over the peer table and its file.
pub struct AppState {
    manager: Mutex<VpnManager>,
    settings: Settings,
    client: Client,
}

impl AppState {
    pub fn new(manager: VpnManager) -> Self {
        AppState {
            settings: manager.settings().clone(),
            manager: Mutex::new(manager),
            client: Client::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/router/api/version", get(version))
        .route("/api/get_ip/{host}", get(get_ip))
        .route("/api/register", post(register))
        .with_state(state)
}

enum AdmissionError {
    Unauthorized,
    Internal,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        // no internals leak to the caller; details are already logged
        match self {
            AdmissionError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            AdmissionError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response(),
        }
    }
}

async fn ping() -> &'static str {
    "ok"
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: ROUTER_API_VERSION,
    })
}

async fn get_ip(State(state): State<Arc<AppState>>, Path(host): Path<String>) -> Response {
    let Some(name) = peer_name_from_host(&host, &state.settings.announce_domain) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.manager.lock().await.ip_from_name(&name) {
        Some(ip) => format!("http://{ip}:80").into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn register(State(state): State<Arc<AppState>>, Json(request): Json<RegisterRequest>) -> Response {
    match handle_register(&state, request).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_register(state: &AppState, request: RegisterRequest) -> Result<RegisterResponse, AdmissionError> {
    let auth = authenticate(state, &request.user_id, &request.auth_token).await?;
    let name = normalize_name(&auth.domain_name);
    if name != ROOT_PEER_NAME && !valid_label(&name) {
        tracing::info!("rejecting registration with an invalid subdomain label");
        return Err(AdmissionError::Unauthorized);
    }

    let mut manager = state.manager.lock().await;
    let registration = manager.register_peer(&request.vpn_public_key, &name).map_err(|e| {
        if e.is_exhausted_pool() {
            tracing::error!(peer = %name, "address pool exhausted, operator action required");
        } else {
            tracing::error!(error = %e, peer = %name, "peer registration failed");
        }
        AdmissionError::Internal
    })?;

    let domain = if name == ROOT_PEER_NAME {
        auth.server_domain.clone()
    } else {
        format!("{name}.{}", auth.server_domain)
    };

    Ok(RegisterResponse {
        wg_config: WgConfig {
            wg_interface: WgInterface {
                address: vec![registration.address],
                private_key: None,
            },
            peers: vec![registration.server_peer],
        },
        server_ip: manager.gateway(),
        server_domain: auth.server_domain,
        domain_name: name,
        domain,
        route_ip: Some(state.settings.route_ip),
        route_port: Some(state.settings.route_port),
    })
}

struct AuthRecord {
    server_domain: String,
    domain_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthReply {
    server_domain: Option<String>,
    domain_name: Option<String>,
}

async fn authenticate(state: &AppState, user_id: &str, auth_token: &str) -> Result<AuthRecord, AdmissionError> {
    let Some(auth_url) = &state.settings.auth_api_url else {
        // no auth backend configured: the user id names the subdomain
        return Ok(AuthRecord {
            server_domain: state.settings.announce_domain.clone(),
            domain_name: if user_id.is_empty() {
                ROOT_PEER_NAME.to_string()
            } else {
                user_id.to_string()
            },
        });
    };

    let mut url = auth_url.clone();
    url.path_segments_mut()
        .map_err(|_| {
            tracing::error!("auth url cannot carry a path");
            AdmissionError::Internal
        })?
        .pop_if_empty()
        .extend([user_id, auth_token]);

    let resp = state
        .client
        .get(url)
        .timeout(AUTH_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "auth backend unreachable");
            AdmissionError::Internal
        })?;

    if !resp.status().is_success() {
        tracing::info!(status = %resp.status(), "auth backend rejected registration");
        return Err(AdmissionError::Unauthorized);
    }

    let reply = resp.json::<AuthReply>().await.map_err(|e| {
        tracing::info!(error = %e, "auth backend returned an unusable record");
        AdmissionError::Unauthorized
    })?;

    match (reply.server_domain, reply.domain_name) {
        (Some(server_domain), Some(domain_name)) => Ok(AuthRecord {
            server_domain,
            domain_name,
        }),
        _ => Err(AdmissionError::Unauthorized),
    }
}

fn normalize_name(domain_name: &str) -> String {
    let name = domain_name.trim().to_ascii_lowercase();
    if name.is_empty() { ROOT_PEER_NAME.to_string() } else { name }
}

/// Subdomain labels keep to DNS-safe characters; anything else never
/// reaches the peer table or its config file.
fn valid_label(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Recover the peer name from a dash-escaped host: strip the announcement
/// suffix, the remainder is the subdomain label (empty means the root peer).
fn peer_name_from_host(host: &str, announce_domain: &str) -> Option<String> {
    let host = host.to_ascii_lowercase();
    let suffix = announce_domain.to_ascii_lowercase().replace('.', "-");
    if host == suffix {
        return Some(ROOT_PEER_NAME.to_string());
    }
    host.strip_suffix(&format!("-{suffix}"))
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
}
