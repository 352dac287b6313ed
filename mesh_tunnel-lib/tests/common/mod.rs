use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use mesh_tunnel_lib::tunnel::{Driver, Error};

/// Driver that never touches the host toolchain; key material is synthetic
/// but stable, which is all the control plane cares about.
#[derive(Debug, Default)]
pub struct NullDriver {
    key_counter: AtomicU32,
}

impl Driver for NullDriver {
    fn generate_key(&self) -> Result<String, Error> {
        let n = self.key_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("priv{n}"))
    }

    fn public_key(&self, private_key: &str) -> Result<String, Error> {
        Ok(format!("{private_key}.pub"))
    }

    fn interface_up(&self, _config_path: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn interface_down(&self, _config_path: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn add_peer(&self, _interface: &str, _public_key: &str, _allowed_ips: &[String]) -> Result<(), Error> {
        Ok(())
    }

    fn remove_peer(&self, _interface: &str, _public_key: &str) -> Result<(), Error> {
        Ok(())
    }

    fn latest_handshakes(&self, _interface: &str) -> Result<HashMap<String, u64>, Error> {
        Ok(HashMap::new())
    }
}
