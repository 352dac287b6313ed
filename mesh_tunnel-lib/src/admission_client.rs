use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use std::net::Ipv4Addr;
use std::time::Duration;

/// Router API revision this client requires; older providers still speak the
/// single-scheme route model and are waited out.
pub const REQUIRED_VERSION: u32 = 2;
pub const CLIENT_VERSION: u32 = 2;

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(30);
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error parsing url: {0}")]
    Url(#[from] url::ParseError),
    #[error("Error making http request: {0:?}")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub user_id: String,
    pub vpn_public_key: String,
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub wg_config: WgConfig,
    pub server_ip: Ipv4Addr,
    pub server_domain: String,
    pub domain_name: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_port: Option<u16>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WgConfig {
    pub wg_interface: WgInterface,
    pub peers: Vec<WgPeer>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WgInterface {
    pub address: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WgPeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub endpoint: String,
    pub persistent_keepalive: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,
}

/// Availability probe against the provider's liveness endpoint.
pub async fn ping(client: &Client, base: &Url) -> Result<(), Error> {
    let url = base.join("api/ping")?;
    tracing::debug!(%url, "get provider liveness");
    client
        .get(url)
        .timeout(AVAILABILITY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub async fn version(client: &Client, base: &Url) -> Result<u32, Error> {
    let url = base.join("router/api/version")?;
    tracing::debug!(%url, "get provider api version");
    let resp = client
        .get(url)
        .timeout(VERSION_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<VersionInfo>()
        .await?;
    Ok(resp.version)
}

pub async fn register(client: &Client, base: &Url, request: &RegisterRequest) -> Result<RegisterResponse, Error> {
    let url = base.join("api/register")?;
    tracing::debug!(%url, user_id = %request.user_id, "post peer registration");
    let resp = client
        .post(url)
        .json(request)
        .timeout(REGISTER_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<RegisterResponse>()
        .await?;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_uses_the_wire_field_names() -> anyhow::Result<()> {
        let request = RegisterRequest {
            user_id: "alice".to_string(),
            vpn_public_key: "pkA".to_string(),
            auth_token: "sig".to_string(),
            client_version: Some(CLIENT_VERSION),
        };
        let json = serde_json::to_value(&request)?;
        assert_eq!(
            json,
            serde_json::json!({
                "userId": "alice",
                "vpnPublicKey": "pkA",
                "authToken": "sig",
                "clientVersion": 2,
            })
        );

        Ok(())
    }

    #[test]
    fn register_response_parses_the_wire_format() -> anyhow::Result<()> {
        let resp: RegisterResponse = serde_json::from_str(
            r#"{
                "wgConfig": {
                    "wgInterface": {"address": ["10.0.0.2/32"]},
                    "peers": [{
                        "publicKey": "server-pub",
                        "allowedIps": ["10.0.0.0/24"],
                        "endpoint": "vpn.example.com:51820",
                        "persistentKeepalive": 60
                    }]
                },
                "serverIp": "10.0.0.1",
                "serverDomain": "example.com",
                "domainName": "alice",
                "domain": "alice.example.com",
                "routeIp": "192.168.1.5",
                "routePort": 443
            }"#,
        )?;

        assert_eq!(resp.wg_config.wg_interface.address, vec!["10.0.0.2/32".to_string()]);
        assert_eq!(resp.wg_config.peers[0].persistent_keepalive, 60);
        assert_eq!(resp.server_ip, "10.0.0.1".parse::<Ipv4Addr>()?);
        assert_eq!(resp.route_port, Some(443));

        Ok(())
    }

    #[test]
    fn register_response_tolerates_missing_route_fields() -> anyhow::Result<()> {
        let resp: RegisterResponse = serde_json::from_str(
            r#"{
                "wgConfig": {"wgInterface": {"address": ["10.0.0.2/32"]}, "peers": []},
                "serverIp": "10.0.0.1",
                "serverDomain": "example.com",
                "domainName": "$root$",
                "domain": "example.com"
            }"#,
        )?;

        assert_eq!(resp.route_ip, None);
        assert_eq!(resp.route_port, None);

        Ok(())
    }
}
