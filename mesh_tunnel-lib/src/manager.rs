use ipnet::Ipv4Net;
use thiserror::Error;
use url::Url;

use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::admission_client::WgPeer;
use crate::ip_pool::{self, IpPool};
use crate::peer_table::{self, Peer, PeerTable};
use crate::tunnel::{self, Driver};
use crate::wg_config::{self, DeviceConfig, Interface};

/// The provider's authoritative tunnel configuration, also the peer store.
pub const WG_CONFIG_FILE: &str = "mesh0.conf";

const PERSISTENT_KEEPALIVE: u16 = 60;

#[derive(Debug, Error)]
pub enum Error {
    #[error("announcement domain is not configured")]
    MissingAnnounceDomain,
    #[error("overlay subnet {0} leaves no allocatable hosts")]
    SubnetTooSmall(Ipv4Net),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::Error),
    #[error("config file error: {0}")]
    Config(#[from] wg_config::Error),
    #[error("peer table error: {0}")]
    Table(#[from] peer_table::Error),
    #[error("ip pool error: {0}")]
    Pool(#[from] ip_pool::Error),
}

impl Error {
    /// Pool exhaustion needs operator action; everything else here is an
    /// internal failure as far as admission is concerned.
    pub fn is_exhausted_pool(&self) -> bool {
        matches!(self, Error::Pool(ip_pool::Error::Exhausted(_)))
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub subnet: Ipv4Net,
    pub listen_port: u16,
    /// Public `host:port` announced to peers as the tunnel endpoint.
    pub endpoint: String,
    pub announce_domain: String,
    pub route_ip: Ipv4Addr,
    pub route_port: u16,
    pub auth_api_url: Option<Url>,
    pub config_dir: PathBuf,
}

/// What a successful registration hands back to the requester: its overlay
/// address and the server-side peer template.
#[derive(Clone, Debug)]
pub struct Registration {
    pub address: String,
    pub server_peer: WgPeer,
}

/// Orchestrates pool, peer table and tunnel interface behind admission.
#[derive(Debug)]
pub struct VpnManager {
    settings: Settings,
    pool: IpPool,
    table: PeerTable,
    server_public_key: String,
}

impl VpnManager {
    /// Bring up the provider side: reuse or scaffold the tunnel config,
    /// reset the interface, and lease every persisted peer's address.
    pub fn init(settings: Settings, driver: Arc<dyn Driver>) -> Result<Self, Error> {
        if settings.announce_domain.trim().is_empty() {
            return Err(Error::MissingAnnounceDomain);
        }
        if settings.subnet.prefix_len() > 30 {
            return Err(Error::SubnetTooSmall(settings.subnet));
        }

        let mut pool = IpPool::new(settings.subnet);
        fs::create_dir_all(&settings.config_dir)?;
        let config_path = settings.config_dir.join(WG_CONFIG_FILE);

        let private_key = if config_path.exists() {
            DeviceConfig::load(&config_path)?.interface.private_key
        } else {
            let private_key = driver.generate_key()?;
            let scaffold = DeviceConfig {
                interface: Interface {
                    private_key: private_key.clone(),
                    address: format!("{}/{}", pool.gateway(), settings.subnet.prefix_len()),
                    listen_port: Some(settings.listen_port),
                },
                peers: Vec::new(),
            };
            scaffold.store(&config_path)?;
            tracing::info!(path = %config_path.display(), "created tunnel config scaffold");
            private_key
        };
        let server_public_key = driver.public_key(&private_key)?;

        // toggle down first to clear stale state from a previous run
        if let Err(e) = driver.interface_down(&config_path) {
            tracing::debug!(error = %e, "interface was not up before start");
        }
        driver.interface_up(&config_path)?;

        let table = PeerTable::load(&config_path, driver)?;
        for (name, peer) in table.all() {
            pool.lease(peer.ip, true).inspect_err(|e| {
                tracing::error!(%name, error = %e, "persisted peer holds an unusable address");
            })?;
        }
        tracing::info!(peers = table.len(), subnet = %settings.subnet, "vpn manager ready");

        Ok(VpnManager {
            settings,
            pool,
            table,
            server_public_key,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.pool.gateway()
    }

    pub fn server_public_key(&self) -> &str {
        &self.server_public_key
    }

    /// Admit a peer under `name`.
    ///
    /// Same name and key: idempotent, the existing address is returned.
    /// Same name, new key: the old record is dropped (releasing its address)
    /// and a fresh one allocated — the key rotation path.
    pub fn register_peer(&mut self, public_key: &str, name: &str) -> Result<Registration, Error> {
        let existing = self.table.get(name).cloned();
        if let Some(existing) = existing {
            if existing.public_key == public_key {
                tracing::debug!(%name, "repeat registration with unchanged key");
                return Ok(self.registration(existing.ip));
            }
            tracing::info!(%name, "rotating key for registered peer");
            self.remove_peer(name)?;
        }

        let ip = self.pool.allocate()?;
        let peer = Peer {
            public_key: public_key.to_string(),
            ip,
        };
        if let Err(e) = self.table.add(name, peer) {
            self.pool.release(ip);
            return Err(e.into());
        }
        tracing::info!(%name, %ip, "registered peer");
        Ok(self.registration(ip))
    }

    pub fn remove_peer(&mut self, name: &str) -> Result<Option<Peer>, Error> {
        let removed = self.table.delete(name)?;
        if let Some(peer) = &removed {
            self.pool.release(peer.ip);
            tracing::info!(%name, ip = %peer.ip, "removed peer");
        }
        Ok(removed)
    }

    /// Name resolution for the edge proxy; pure read.
    pub fn ip_from_name(&self, name: &str) -> Option<Ipv4Addr> {
        self.table.get(name).map(|peer| peer.ip)
    }

    fn registration(&self, ip: Ipv4Addr) -> Registration {
        Registration {
            address: format!("{ip}/32"),
            server_peer: WgPeer {
                public_key: self.server_public_key.clone(),
                allowed_ips: vec![self.settings.subnet.to_string()],
                endpoint: self.settings.endpoint.clone(),
                persistent_keepalive: PERSISTENT_KEEPALIVE,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_table::ROOT_PEER_NAME;
    use crate::tunnel::mock::MockDriver;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            subnet: "10.0.0.0/24".parse().expect("cidr"),
            listen_port: 51820,
            endpoint: "vpn.example.com:51820".to_string(),
            announce_domain: "example.com".to_string(),
            route_ip: "192.168.1.5".parse().expect("ip"),
            route_port: 80,
            auth_api_url: None,
            config_dir: dir.path().to_path_buf(),
        }
    }

    fn manager(dir: &TempDir) -> VpnManager {
        VpnManager::init(settings(dir), Arc::new(MockDriver::default())).expect("manager init")
    }

    #[test]
    fn first_registration_gets_the_first_free_host() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = manager(&dir);

        let reg = manager.register_peer("pkA", "alice")?;

        assert_eq!(reg.address, "10.0.0.2/32");
        assert_eq!(reg.server_peer.allowed_ips, vec!["10.0.0.0/24".to_string()]);
        assert_eq!(reg.server_peer.endpoint, "vpn.example.com:51820");
        assert_eq!(reg.server_peer.persistent_keepalive, 60);
        assert_eq!(manager.ip_from_name("alice"), Some("10.0.0.2".parse()?));

        Ok(())
    }

    #[test]
    fn repeat_registration_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = manager(&dir);

        let first = manager.register_peer("pkA", "alice")?;
        let second = manager.register_peer("pkA", "alice")?;

        assert_eq!(first.address, second.address);
        assert_eq!(manager.table.len(), 1);

        Ok(())
    }

    #[test]
    fn key_rotation_moves_the_peer_forward() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = manager(&dir);

        manager.register_peer("pkA", "alice")?;
        let rotated = manager.register_peer("pkA2", "alice")?;
        assert_eq!(rotated.address, "10.0.0.3/32");

        let bob = manager.register_peer("pkB", "bob")?;
        assert_eq!(bob.address, "10.0.0.4/32");
        assert_eq!(manager.table.len(), 2);

        Ok(())
    }

    #[test]
    fn rotated_away_address_returns_to_the_pool() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut small = settings(&dir);
        // /29 leaves .2 to .6 after the reserved gateway
        small.subnet = "10.0.0.0/29".parse()?;
        let mut manager = VpnManager::init(small, Arc::new(MockDriver::default()))?;

        manager.register_peer("pkA", "alice")?;
        manager.register_peer("pkA2", "alice")?;
        manager.register_peer("pkB", "bob")?;
        manager.register_peer("pkC", "carol")?;
        manager.register_peer("pkD", "dave")?;

        // .3 to .6 are held, so the wrap lands on the address alice rotated away from
        let eve = manager.register_peer("pkE", "eve")?;
        assert_eq!(eve.address, "10.0.0.2/32");

        Ok(())
    }

    #[test]
    fn root_peer_resolves_only_when_registered() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = manager(&dir);

        assert_eq!(manager.ip_from_name(ROOT_PEER_NAME), None);
        manager.register_peer("pkRoot", ROOT_PEER_NAME)?;
        assert_eq!(manager.ip_from_name(ROOT_PEER_NAME), Some("10.0.0.2".parse()?));

        Ok(())
    }

    #[test]
    fn restart_reloads_peers_and_keeps_leases() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut manager = manager(&dir);
            manager.register_peer("pkA", "alice")?;
            manager.register_peer("pkB", "bob")?;
        }

        let mut reloaded = manager(&dir);
        assert_eq!(reloaded.ip_from_name("alice"), Some("10.0.0.2".parse()?));
        assert_eq!(reloaded.ip_from_name("bob"), Some("10.0.0.3".parse()?));

        // fresh registrations keep allocating past the reloaded leases
        let carol = reloaded.register_peer("pkC", "carol")?;
        assert_eq!(carol.address, "10.0.0.4/32");

        Ok(())
    }

    #[test]
    fn server_key_pair_survives_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = manager(&dir).server_public_key().to_string();
        let second = manager(&dir).server_public_key().to_string();
        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn missing_announce_domain_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut bad = settings(&dir);
        bad.announce_domain = "".to_string();

        let res = VpnManager::init(bad, Arc::new(MockDriver::default()));
        assert!(matches!(res, Err(Error::MissingAnnounceDomain)));

        Ok(())
    }

    #[test]
    fn exhausted_pool_surfaces_as_such() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut small = settings(&dir);
        small.subnet = "10.0.0.0/30".parse()?;

        let mut manager = VpnManager::init(small, Arc::new(MockDriver::default()))?;
        manager.register_peer("pkA", "alice")?;
        let res = manager.register_peer("pkB", "bob");
        assert!(res.as_ref().err().map(Error::is_exhausted_pool).unwrap_or(false));

        Ok(())
    }
}
