use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("unknown secret engine: {0}")]
    UnknownEngine(String),

    #[error("secret path not found: {0}")]
    NotFound(String),

    #[error("missing secret entry: {0}")]
    MissingEntry(&'static str),

    #[error("engine not configured: {0}")]
    NotConfigured(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}
