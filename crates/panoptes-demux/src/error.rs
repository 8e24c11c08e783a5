use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("invalid output routing: {0}")]
    InvalidOutput(String),

    #[error("sink config error: {0}")]
    SinkConfig(String),

    #[error("write error: {0}")]
    Write(String),

    #[error(transparent)]
    Secrets(#[from] panoptes_secrets::SecretsError),
}
