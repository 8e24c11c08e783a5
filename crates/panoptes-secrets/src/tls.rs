//! TLS material loading for device and sink connections.

use panoptes_config::TlsConfig;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::warn;

use crate::error::SecretsError;
use crate::{get_secret_engine, parse_remote_secret};

/// Builds client TLS settings from a [`TlsConfig`].
///
/// The certificate fields accept either local PEM file paths or
/// `__<engine>::<path>` remote references providing `cert`, `key`, and an
/// optional `ca`. An empty `key_file` means the cert file holds the
/// combined certificate and private key.
pub async fn tls_config(cfg: &TlsConfig) -> Result<ClientTlsConfig, SecretsError> {
    if cfg.insecure_skip_verify {
        warn!("insecure_skip_verify requested; server verification stays enabled");
    }

    if let Some((engine, path)) = parse_remote_secret(&cfg.cert_file) {
        return remote(engine, path).await;
    }

    local(cfg)
}

async fn remote(engine: &str, path: &str) -> Result<ClientTlsConfig, SecretsError> {
    let engine = get_secret_engine(engine)?;
    let secrets = engine.get_secrets(path).await?;

    let cert = secrets
        .get("cert")
        .ok_or(SecretsError::MissingEntry("cert"))?;
    let key = secrets.get("key").ok_or(SecretsError::MissingEntry("key"))?;

    let mut tls = ClientTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(ca) = secrets.get("ca") {
        tls = tls.ca_certificate(Certificate::from_pem(ca));
    }

    Ok(tls)
}

fn local(cfg: &TlsConfig) -> Result<ClientTlsConfig, SecretsError> {
    // Combined cert and private key in one file.
    let key_file = if cfg.key_file.is_empty() {
        &cfg.cert_file
    } else {
        &cfg.key_file
    };

    let cert = std::fs::read(&cfg.cert_file)?;
    let key = std::fs::read(key_file)?;

    let mut tls = ClientTlsConfig::new().identity(Identity::from_pem(cert, key));

    if !cfg.ca_file.is_empty() {
        let ca = std::fs::read(&cfg.ca_file)?;
        tls = tls.ca_certificate(Certificate::from_pem(ca));
    }

    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn local_combined_cert_and_key() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n")
            .unwrap();

        let cfg = TlsConfig {
            enabled: true,
            cert_file: cert.path().display().to_string(),
            ..Default::default()
        };

        assert!(tls_config(&cfg).await.is_ok());
    }

    #[tokio::test]
    async fn missing_local_file_is_an_io_error() {
        let cfg = TlsConfig {
            enabled: true,
            cert_file: "/nonexistent/cert.pem".to_owned(),
            ..Default::default()
        };

        assert!(matches!(
            tls_config(&cfg).await,
            Err(SecretsError::Io(_))
        ));
    }
}
