use thiserror::Error;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("missing [Interface] section")]
    MissingInterface,
    #[error("interface has no PrivateKey")]
    MissingPrivateKey,
    #[error("interface has no Address")]
    MissingAddress,
    #[error("peer has no PublicKey")]
    PeerMissingPublicKey,
    #[error("invalid number in `{0}`")]
    InvalidNumber(String),
    #[error("unexpected line `{0}`")]
    UnexpectedLine(String),
}

/// Typed model of a WireGuard configuration file.
///
/// On the provider this file doubles as the authoritative peer store: each
/// `[Peer]` section carries a `# Name = <name>` annotation that survives the
/// round trip through `to_file_string` / `parse`.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub interface: Interface,
    pub peers: Vec<PeerSection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    pub private_key: String,
    pub address: String,
    pub listen_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeerSection {
    pub name: Option<String>,
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
}

impl DeviceConfig {
    pub fn to_file_string(&self) -> String {
        let listen_port_line = self
            .interface
            .listen_port
            .map(|port| format!("ListenPort = {port}\n"))
            .unwrap_or_default();

        let mut out = format!(
            "[Interface]
PrivateKey = {private_key}
Address = {address}
{listen_port_line}",
            private_key = self.interface.private_key,
            address = self.interface.address,
            listen_port_line = listen_port_line,
        );

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            if let Some(name) = &peer.name {
                out.push_str(&format!("# Name = {name}\n"));
            }
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {endpoint}\n"));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                out.push_str(&format!("PersistentKeepalive = {keepalive}\n"));
            }
        }

        out
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut section = Section::None;
        let mut private_key: Option<String> = None;
        let mut address: Option<String> = None;
        let mut listen_port: Option<u16> = None;
        let mut peers: Vec<PeerSection> = Vec::new();

        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            // `# Name = <name>` annotations are ours; all other comments pass through
            if line.starts_with('#') && !line.starts_with("# Name") {
                continue;
            }
            match line {
                "[Interface]" => {
                    section = Section::Interface;
                    continue;
                }
                "[Peer]" => {
                    section = Section::Peer;
                    peers.push(PeerSection {
                        name: None,
                        public_key: String::new(),
                        allowed_ips: Vec::new(),
                        endpoint: None,
                        persistent_keepalive: None,
                    });
                    continue;
                }
                _ => {}
            }

            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => return Err(Error::UnexpectedLine(line.to_string())),
            };

            match section {
                Section::None => return Err(Error::UnexpectedLine(line.to_string())),
                Section::Interface => match key {
                    "PrivateKey" => private_key = Some(value.to_string()),
                    "Address" => address = Some(value.to_string()),
                    "ListenPort" => listen_port = Some(parse_number(value, line)?),
                    _ if key.starts_with('#') => {}
                    _ => return Err(Error::UnexpectedLine(line.to_string())),
                },
                Section::Peer => {
                    let peer = peers.last_mut().expect("peer section started");
                    match key {
                        "# Name" => peer.name = Some(value.to_string()),
                        "PublicKey" => peer.public_key = value.to_string(),
                        "AllowedIPs" => {
                            peer.allowed_ips = value.split(',').map(|ip| ip.trim().to_string()).collect()
                        }
                        "Endpoint" => peer.endpoint = Some(value.to_string()),
                        "PersistentKeepalive" => peer.persistent_keepalive = Some(parse_number(value, line)?),
                        _ if key.starts_with('#') => {}
                        _ => return Err(Error::UnexpectedLine(line.to_string())),
                    }
                }
            }
        }

        if matches!(section, Section::None) {
            return Err(Error::MissingInterface);
        }
        if peers.iter().any(|peer| peer.public_key.is_empty()) {
            return Err(Error::PeerMissingPublicKey);
        }

        Ok(DeviceConfig {
            interface: Interface {
                private_key: private_key.ok_or(Error::MissingPrivateKey)?,
                address: address.ok_or(Error::MissingAddress)?,
                listen_port,
            },
            peers,
        })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Write the config so a crash leaves either the old or the new file,
    /// never a torn one.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        write_atomic(path, &self.to_file_string())?;
        Ok(())
    }
}

pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    fs::rename(&tmp, path)
}

fn parse_number(value: &str, line: &str) -> Result<u16, Error> {
    value.parse().map_err(|_| Error::InvalidNumber(line.to_string()))
}
