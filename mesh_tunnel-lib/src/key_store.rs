use thiserror::Error;
use url::Url;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::dirs;
use crate::tunnel::{self, Driver};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Long-term key pair cache, one pair per provider URL.
#[derive(Clone, Debug)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: PathBuf) -> Self {
        KeyStore { dir }
    }

    fn private_path(&self, provider_url: &Url) -> PathBuf {
        self.dir.join(format!("{}.key", dirs::provider_slug(provider_url)))
    }

    fn public_path(&self, provider_url: &Url) -> PathBuf {
        self.dir.join(format!("{}.pub", dirs::provider_slug(provider_url)))
    }

    /// Return the stored pair for this provider, generating it on first use.
    /// A stored pair whose public key no longer matches its private key is
    /// regenerated and overwritten.
    pub fn get_or_generate(&self, driver: &dyn Driver, provider_url: &Url) -> Result<KeyPair, Error> {
        let private_path = self.private_path(provider_url);
        let public_path = self.public_path(provider_url);

        if private_path.exists() && public_path.exists() {
            let private_key = fs::read_to_string(&private_path)?.trim().to_string();
            let public_key = fs::read_to_string(&public_path)?.trim().to_string();
            if driver.public_key(&private_key)? == public_key {
                return Ok(KeyPair {
                    private_key,
                    public_key,
                });
            }
            tracing::warn!(path = %private_path.display(), "stored key pair mismatch, regenerating");
        }

        let private_key = driver.generate_key()?;
        let public_key = driver.public_key(&private_key)?;
        fs::create_dir_all(&self.dir)?;
        write_secret(&private_path, &private_key)?;
        fs::write(&public_path, &public_key)?;
        tracing::info!(path = %private_path.display(), "generated key pair");

        Ok(KeyPair {
            private_key,
            public_key,
        })
    }
}

fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::mock::MockDriver;

    #[test]
    fn generates_once_and_reuses() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KeyStore::new(dir.path().to_path_buf());
        let driver = MockDriver::default();
        let url = Url::parse("https://provider.example.com")?;

        let first = store.get_or_generate(&driver, &url)?;
        let second = store.get_or_generate(&driver, &url)?;

        assert_eq!(first, second);
        assert_eq!(first.public_key, format!("{}.pub", first.private_key));

        Ok(())
    }

    #[test]
    fn distinct_providers_get_distinct_pairs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KeyStore::new(dir.path().to_path_buf());
        let driver = MockDriver::default();

        let a = store.get_or_generate(&driver, &Url::parse("https://one.example.com")?)?;
        let b = store.get_or_generate(&driver, &Url::parse("https://two.example.com")?)?;

        assert_ne!(a, b);

        Ok(())
    }

    #[test]
    fn mismatched_pair_is_regenerated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KeyStore::new(dir.path().to_path_buf());
        let driver = MockDriver::default();
        let url = Url::parse("https://provider.example.com")?;

        let first = store.get_or_generate(&driver, &url)?;
        fs::write(store.public_path(&url), "tampered")?;

        let second = store.get_or_generate(&driver, &url)?;
        assert_ne!(first, second);
        assert_eq!(second.public_key, format!("{}.pub", second.private_key));

        Ok(())
    }

    #[test]
    fn private_key_file_is_owner_only() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KeyStore::new(dir.path().to_path_buf());
        let driver = MockDriver::default();
        let url = Url::parse("https://provider.example.com")?;

        store.get_or_generate(&driver, &url)?;
        let mode = fs::metadata(store.private_path(&url))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        Ok(())
    }
}
