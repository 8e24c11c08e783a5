//! HashiCorp Vault engine.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SecretsError;
use crate::SecretEngine;

/// Vault over its HTTP API, configured from the standard `VAULT_ADDR` and
/// `VAULT_TOKEN` environment variables.
pub struct Vault {
    client: reqwest::Client,
    address: String,
    token: String,
}

impl Vault {
    pub fn from_env() -> Result<Self, SecretsError> {
        let address = std::env::var("VAULT_ADDR")
            .unwrap_or_else(|_| "http://127.0.0.1:8200".to_owned());
        let token = std::env::var("VAULT_TOKEN")
            .map_err(|_| SecretsError::NotConfigured("VAULT_TOKEN is not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_owned(),
            token,
        })
    }
}

#[async_trait]
impl SecretEngine for Vault {
    async fn get_secrets(&self, path: &str) -> Result<HashMap<String, Vec<u8>>, SecretsError> {
        let url = format!("{}/v1/{}", self.address, path.trim_start_matches('/'));

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretsError::NotFound(path.to_owned()));
        }

        if !response.status().is_success() {
            return Err(SecretsError::Backend(format!(
                "vault read failed: {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        let data = extract_data(&body).ok_or_else(|| SecretsError::NotFound(path.to_owned()))?;

        Ok(data
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.as_bytes().to_vec())))
            .collect())
    }
}

/// Unwraps the secret payload, descending through the KV v2 `data.data`
/// nesting when present.
fn extract_data(body: &serde_json::Value) -> Option<&serde_json::Map<String, serde_json::Value>> {
    let data = body.get("data")?.as_object()?;

    if data.contains_key("metadata") {
        if let Some(inner) = data.get("data").and_then(|v| v.as_object()) {
            return Some(inner);
        }
    }

    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_v1_payload() {
        let body = serde_json::json!({"data": {"cert": "PEM", "key": "PEM"}});
        let data = extract_data(&body).unwrap();
        assert_eq!(data["cert"], "PEM");
    }

    #[test]
    fn kv_v2_payload_unwraps_nested_data() {
        let body = serde_json::json!({
            "data": {
                "data": {"token": "s3cret"},
                "metadata": {"version": 2}
            }
        });
        let data = extract_data(&body).unwrap();
        assert_eq!(data["token"], "s3cret");
    }

    #[test]
    fn missing_data_is_none() {
        assert!(extract_data(&serde_json::json!({"errors": []})).is_none());
    }
}
