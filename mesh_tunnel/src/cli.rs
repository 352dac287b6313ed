use clap::{Args, Parser, Subcommand};
use ipnet::Ipv4Net;
use url::Url;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use mesh_tunnel_lib::config;

/// Overlay tunnel daemon: expose local services under a public domain
/// through a cooperating provider host
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Terminate public traffic and admit requester peers
    Provider(ProviderArgs),
    /// Tunnel local services out through the configured providers
    Requester(RequesterArgs),
}

#[derive(Clone, Debug, Args)]
pub struct ProviderArgs {
    /// Overlay subnet peers get their addresses from
    #[arg(long, env = "VPN_IP_RANGE", default_value = "10.8.0.0/24")]
    pub ip_range: Ipv4Net,

    /// Tunnel listen port
    #[arg(long, env = "VPN_PORT", default_value_t = 51820)]
    pub vpn_port: u16,

    /// Public host:port announced to peers as the tunnel endpoint
    #[arg(long, env = "VPN_ENDPOINT_ANNOUNCE")]
    pub endpoint_announce: String,

    /// Public DNS suffix under which peers receive subdomains
    #[arg(long, env = "PROVIDER_ANNONCE_DOMAIN")]
    pub announce_domain: String,

    /// Internal gateway address announced in route records
    #[arg(long, env = "PROVIDER_ROUTE_IP")]
    pub route_ip: Ipv4Addr,

    /// Port announced in route records
    #[arg(long, env = "PROVIDER_ROUTE_PORT", default_value_t = 80)]
    pub route_port: u16,

    /// External authentication backend; absent means open admission
    #[arg(long, env = "AUTH_API_URL")]
    pub auth_api_url: Option<Url>,

    /// Listen address of the admission api
    #[arg(long, env = "PROVIDER_API_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Directory holding the authoritative tunnel config
    #[arg(long, env = "VPN_CONFIG_DIR", default_value = "/etc/meshtunnel")]
    pub config_dir: PathBuf,
}

#[derive(Clone, Debug, Args)]
pub struct RequesterArgs {
    /// Declarative provider configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,

    /// Route target fallback when a provider announces none
    #[arg(long, env = "ROUTING_TARGET_HOST")]
    pub target_host: Option<Ipv4Addr>,

    #[arg(long, env = "ROUTING_TARGET_PORT_HTTP", default_value_t = 80)]
    pub target_port_http: u16,

    #[arg(long, env = "ROUTING_TARGET_PORT_HTTPS", default_value_t = 443)]
    pub target_port_https: u16,

    #[arg(long, env = "ROUTE_PRIORITY", default_value_t = 2)]
    pub route_priority: u16,

    /// Cadence of route record renewal
    #[arg(long, env = "ROUTE_REFRESH_INTERVAL", default_value = "300s", value_parser = humantime::parse_duration)]
    pub route_refresh_interval: Duration,

    /// Backoff before retrying a provider with an incompatible api
    #[arg(long, env = "PROVIDER_RETRY_INTERVAL", default_value = "600s", value_parser = humantime::parse_duration)]
    pub provider_retry_interval: Duration,

    /// Cadence of availability probing
    #[arg(long, env = "PING_RETRY_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub ping_retry_interval: Duration,

    /// How long a tunnel may stay silent before it is restarted
    #[arg(long, env = "HANDSHAKE_THRESHOLD", default_value = "3m", value_parser = humantime::parse_duration)]
    pub handshake_threshold: Duration,

    /// Cadence of handshake polling
    #[arg(long, env = "HANDSHAKE_POLL_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub handshake_poll_interval: Duration,

    /// Health check path announced on the https route
    #[arg(long, env = "HEALTH_CHECK_PATH")]
    pub health_check_path: Option<String>,

    /// Host header for the announced health check
    #[arg(long, env = "HEALTH_CHECK_HOST")]
    pub health_check_host: Option<String>,

    /// Where per-provider tunnel configs and key pairs live
    #[arg(long, env = "MESHTUNNEL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_with_minimum_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from([
            "mesh_tunnel",
            "provider",
            "--endpoint-announce",
            "vpn.example.com:51820",
            "--announce-domain",
            "example.com",
            "--route-ip",
            "192.168.1.5",
        ])?;

        match args.command {
            Command::Provider(provider) => {
                assert_eq!(provider.ip_range, "10.8.0.0/24".parse::<Ipv4Net>()?);
                assert_eq!(provider.route_port, 80);
                assert!(provider.auth_api_url.is_none());
            }
            _ => panic!("expected provider subcommand"),
        }

        Ok(())
    }

    #[test]
    fn provider_requires_the_announce_domain() {
        let res = Cli::try_parse_from([
            "mesh_tunnel",
            "provider",
            "--endpoint-announce",
            "vpn.example.com:51820",
            "--route-ip",
            "192.168.1.5",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn parses_requester_with_defaults() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["mesh_tunnel", "requester", "--config-path", "/tmp/config.toml"])?;

        match args.command {
            Command::Requester(requester) => {
                assert_eq!(requester.target_port_http, 80);
                assert_eq!(requester.target_port_https, 443);
                assert_eq!(requester.route_priority, 2);
                assert_eq!(requester.route_refresh_interval, Duration::from_secs(300));
                assert_eq!(requester.provider_retry_interval, Duration::from_secs(600));
                assert_eq!(requester.handshake_threshold, Duration::from_secs(180));
            }
            _ => panic!("expected requester subcommand"),
        }

        Ok(())
    }
}
