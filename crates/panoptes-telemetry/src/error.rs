use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("service not registered: {0}")]
    UnknownService(String),

    #[error(transparent)]
    Secrets(#[from] panoptes_secrets::SecretsError),
}

impl From<tonic::Status> for TelemetryError {
    fn from(status: tonic::Status) -> Self {
        TelemetryError::Stream(status.to_string())
    }
}

impl From<tonic::transport::Error> for TelemetryError {
    fn from(err: tonic::transport::Error) -> Self {
        TelemetryError::Transport(err.to_string())
    }
}
