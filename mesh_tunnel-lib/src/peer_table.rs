use thiserror::Error;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::tunnel::{self, Driver};
use crate::wg_config::{self, DeviceConfig, Interface, PeerSection};

/// Distinguished peer name serving the apex of the announcement domain.
pub const ROOT_PEER_NAME: &str = "$root$";

#[derive(Debug, Error)]
pub enum Error {
    #[error("config file error: {0}")]
    Config(#[from] wg_config::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::Error),
    #[error("config path `{0}` does not yield an interface name")]
    BadPath(PathBuf),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Peer {
    pub public_key: String,
    pub ip: Ipv4Addr,
}

impl Peer {
    pub fn allowed_ips(&self) -> Vec<String> {
        vec![format!("{}/32", self.ip)]
    }
}

/// Durable map of peer name to key and overlay address.
///
/// The tunnel configuration file is the authoritative store: every mutation
/// updates the in-memory map, mutates the live interface, and atomically
/// rewrites the file so that it always reflects the map.
#[derive(Debug)]
pub struct PeerTable {
    path: PathBuf,
    interface_name: String,
    interface: Interface,
    driver: Arc<dyn Driver>,
    peers: BTreeMap<String, Peer>,
}

impl PeerTable {
    /// Rebuild the in-memory map from the configuration file.
    pub fn load(path: &Path, driver: Arc<dyn Driver>) -> Result<Self, Error> {
        let interface_name = tunnel::interface_name(path)
            .ok_or_else(|| Error::BadPath(path.to_path_buf()))?
            .to_string();
        let device = DeviceConfig::load(path)?;

        let mut peers = BTreeMap::new();
        for section in device.peers {
            let Some(name) = section.name.clone() else {
                tracing::warn!(public_key = %section.public_key, "skipping unnamed peer in config file");
                continue;
            };
            let Some(ip) = peer_ip(&section) else {
                tracing::warn!(%name, "skipping peer without usable overlay address");
                continue;
            };
            peers.insert(
                name,
                Peer {
                    public_key: section.public_key,
                    ip,
                },
            );
        }

        Ok(PeerTable {
            path: path.to_path_buf(),
            interface_name,
            interface: device.interface,
            driver,
            peers,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &Peer)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Add a peer: live interface first, then map and file.
    pub fn add(&mut self, name: &str, peer: Peer) -> Result<(), Error> {
        self.driver
            .add_peer(&self.interface_name, &peer.public_key, &peer.allowed_ips())?;
        self.peers.insert(name.to_string(), peer);
        self.store()
    }

    /// Remove a peer from interface, map and file. Absent names are a no-op.
    pub fn delete(&mut self, name: &str) -> Result<Option<Peer>, Error> {
        let Some(peer) = self.peers.get(name).cloned() else {
            return Ok(None);
        };
        self.driver.remove_peer(&self.interface_name, &peer.public_key)?;
        self.peers.remove(name);
        self.store()?;
        Ok(Some(peer))
    }

    fn store(&self) -> Result<(), Error> {
        self.device_config().store(&self.path)?;
        Ok(())
    }

    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            interface: self.interface.clone(),
            peers: self
                .peers
                .iter()
                .map(|(name, peer)| PeerSection {
                    name: Some(name.clone()),
                    public_key: peer.public_key.clone(),
                    allowed_ips: peer.allowed_ips(),
                    endpoint: None,
                    persistent_keepalive: None,
                })
                .collect(),
        }
    }
}

fn peer_ip(section: &PeerSection) -> Option<Ipv4Addr> {
    let first = section.allowed_ips.first()?;
    first.split('/').next()?.parse().ok()
}
