//! Remote secret resolution.
//!
//! Any configuration string of the form `__<engine>::<path>` is resolved
//! through a secret engine; the returned map provides `cert`, `key`, an
//! optional `ca`, or `token` entries depending on what the path holds.

pub mod error;
pub mod tls;
pub mod vault;

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

pub use error::SecretsError;
pub use tls::tls_config;

/// A secret store capable of reading a map of named values at a path.
#[async_trait]
pub trait SecretEngine: Send + Sync {
    async fn get_secrets(&self, path: &str) -> Result<HashMap<String, Vec<u8>>, SecretsError>;
}

/// Constructs the engine named in a secret reference.
pub fn get_secret_engine(engine: &str) -> Result<Box<dyn SecretEngine>, SecretsError> {
    match engine {
        "vault" => Ok(Box::new(vault::Vault::from_env()?)),
        other => Err(SecretsError::UnknownEngine(other.to_owned())),
    }
}

/// Splits a `__<engine>::<path>` reference into its parts. Returns `None`
/// for plain strings.
pub fn parse_remote_secret(key: &str) -> Option<(&str, &str)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"__([a-zA-Z0-9]+)::(.+)").expect("static regex"));

    let caps = re.captures(key)?;
    Some((
        caps.get(1).map(|m| m.as_str())?,
        caps.get(2).map(|m| m.as_str())?,
    ))
}

/// Resolves a credential reference to a string map. Returns `Ok(None)` when
/// `key` is not a remote secret reference.
pub async fn get_credentials(key: &str) -> Result<Option<HashMap<String, String>>, SecretsError> {
    let Some((engine, path)) = parse_remote_secret(key) else {
        return Ok(None);
    };

    let engine = get_secret_engine(engine)?;
    let secrets = engine.get_secrets(path).await?;

    Ok(Some(
        secrets
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_secret_syntax() {
        assert_eq!(
            parse_remote_secret("__vault::secret/data/panoptes/tls"),
            Some(("vault", "secret/data/panoptes/tls"))
        );
        assert_eq!(parse_remote_secret("/etc/panoptes/cert.pem"), None);
        assert_eq!(parse_remote_secret("__::missing-engine"), None);
    }

    #[test]
    fn unknown_engine_is_an_error() {
        assert!(matches!(
            get_secret_engine("sops"),
            Err(SecretsError::UnknownEngine(_))
        ));
    }
}
