use thiserror::Error;

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;

mod tooling;

pub use tooling::{Tooling, available};

#[derive(Debug, Error)]
pub enum Error {
    #[error("wireguard toolchain not available")]
    NotAvailable,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
    #[error("wg error [status: {0}]: {1}")]
    Wg(i32, String),
    #[error("wg-quick error [status: {0}]: {1}")]
    WgQuick(i32, String),
    #[error("malformed handshake line `{0}`")]
    MalformedHandshake(String),
}

/// Capability facade over the host tunnel toolchain.
///
/// Only key material and validated addresses ever reach the command line;
/// peer names stay inside the peer table.
pub trait Driver: Send + Sync + Debug {
    fn generate_key(&self) -> Result<String, Error>;
    fn public_key(&self, private_key: &str) -> Result<String, Error>;
    fn interface_up(&self, config_path: &Path) -> Result<(), Error>;
    fn interface_down(&self, config_path: &Path) -> Result<(), Error>;
    fn add_peer(&self, interface: &str, public_key: &str, allowed_ips: &[String]) -> Result<(), Error>;
    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<(), Error>;
    /// Seconds-since-epoch of the last completed handshake per peer key;
    /// 0 means the peer never completed one.
    fn latest_handshakes(&self, interface: &str) -> Result<HashMap<String, u64>, Error>;
}

/// wg-quick derives the interface name from the config file name.
pub fn interface_name(config_path: &Path) -> Option<&str> {
    config_path.file_stem().and_then(|stem| stem.to_str())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn interface_name_is_the_file_stem() {
        let path = PathBuf::from("/etc/meshtunnel/mesh0.conf");
        assert_eq!(interface_name(&path), Some("mesh0"));
    }
}
