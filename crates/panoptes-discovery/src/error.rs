use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("unknown discovery backend: {0}")]
    UnknownBackend(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("instance is not registered")]
    NotRegistered,
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        DiscoveryError::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        DiscoveryError::Backend(err.to_string())
    }
}
