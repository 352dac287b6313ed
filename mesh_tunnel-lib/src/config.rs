use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::Path;
use tokio::fs;

use crate::provider_link::{self, ProviderLink};

pub const DEFAULT_PATH: &str = "/etc/meshtunnel/config.toml";
pub const ENV_VAR: &str = "MESHTUNNEL_CONFIG_PATH";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub providers: Vec<ProviderEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("Unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Unsupported config version: {0}")]
    VersionMismatch(u8),
}

#[derive(Debug, Deserialize)]
struct V1 {
    #[serde(default)]
    providers: Vec<ProviderEntry>,
}

impl Config {
    /// Parse every configured connection string. One malformed entry fails
    /// the whole config, matching the fail-fast startup contract.
    pub fn links(&self) -> Result<Vec<ProviderLink>, provider_link::Error> {
        self.providers.iter().map(|entry| entry.provider.parse()).collect()
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let res = toml::from_str::<V1>(&content)?;
            Ok(Config {
                providers: res.providers,
            })
        }
        _ => Err(Error::VersionMismatch(version as u8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_provider_list() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
version = 1

[[providers]]
provider = "https://provider.example.com,alice,sig123"

[[providers]]
provider = "https://other.example.com,,sig456"
"#,
        )
        .await?;

        let config = read(&path).await?;
        assert_eq!(config.providers.len(), 2);

        let links = config.links()?;
        assert_eq!(links[0].user_id, "alice");
        assert_eq!(links[1].user_id, "");

        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_a_distinct_error() {
        let res = read(Path::new("/nonexistent/config.toml")).await;
        assert!(matches!(res, Err(Error::NoFile)));
    }

    #[tokio::test]
    async fn rejects_unknown_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "version = 9\n").await?;
        assert!(matches!(read(&path).await, Err(Error::VersionMismatch(9))));

        Ok(())
    }

    #[tokio::test]
    async fn rejects_missing_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[[providers]]\nprovider = \"x\"\n").await?;
        assert!(matches!(read(&path).await, Err(Error::VersionNotFound)));

        Ok(())
    }

    #[test]
    fn malformed_connection_string_fails_link_parsing() {
        let config = Config {
            providers: vec![ProviderEntry {
                provider: "not-a-provider".to_string(),
            }],
        };
        assert!(config.links().is_err());
    }
}
