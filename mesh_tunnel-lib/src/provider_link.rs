use thiserror::Error;
use url::Url;

use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection string must be `<backendUrl>,<userId>,<signature>`")]
    MissingFields,
    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
    #[error("backend url scheme must be http or https, got `{0}`")]
    Scheme(String),
    #[error("signature must not be empty")]
    EmptySignature,
}

/// Parsed provider connection string `<backendUrl>,<userId>,<signature>`.
///
/// The backend URL serves both the admission API and the routing API. An
/// empty user id registers the root peer; the signature doubles as the auth
/// token and stays opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderLink {
    pub backend_url: Url,
    pub user_id: String,
    pub signature: String,
}

impl FromStr for ProviderLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(3, ',');
        let (Some(url), Some(user_id), Some(signature)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(Error::MissingFields);
        };

        let backend_url = Url::parse(url.trim())?;
        match backend_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::Scheme(other.to_string())),
        }
        if signature.is_empty() {
            return Err(Error::EmptySignature);
        }

        Ok(ProviderLink {
            backend_url,
            user_id: user_id.trim().to_string(),
            signature: signature.trim().to_string(),
        })
    }
}

impl Display for ProviderLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.backend_url, self.user_id, self.signature)
    }
}
