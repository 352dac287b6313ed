use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

use std::path::PathBuf;
use std::{fs, io};

const DOMAIN: &str = "net";
const COMPANY: &str = "meshtunnel";
const PRODUCT: &str = "meshtunnel";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to determine project directories")]
    NoProjectDirs,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

fn project() -> Option<ProjectDirs> {
    ProjectDirs::from(DOMAIN, COMPANY, PRODUCT)
}

/// Directory holding per-provider tunnel configs and key pairs.
pub fn state_dir() -> Result<PathBuf, Error> {
    let p_dirs = project().ok_or(Error::NoProjectDirs)?;
    let config_dir = p_dirs.config_dir();
    fs::create_dir_all(config_dir)?;
    Ok(config_dir.to_path_buf())
}

/// Stable per-provider identifier, also used as the interface name.
/// Interface names must fit the kernel's 15 character limit, so this is
/// `mt` plus 8 hex chars of an FNV-1a hash of the provider URL.
pub fn provider_slug(url: &Url) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in url.as_str().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    format!("mt{:08x}", hash as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_stable_and_short() -> anyhow::Result<()> {
        let url = Url::parse("https://provider.example.com")?;
        let a = provider_slug(&url);
        let b = provider_slug(&url);
        assert_eq!(a, b);
        assert!(a.len() <= 15);
        assert!(a.starts_with("mt"));

        Ok(())
    }

    #[test]
    fn slugs_differ_per_provider() -> anyhow::Result<()> {
        let a = provider_slug(&Url::parse("https://one.example.com")?);
        let b = provider_slug(&Url::parse("https://two.example.com")?);
        assert_ne!(a, b);

        Ok(())
    }
}
