//! Consul KV provider.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::ConfigError;
use crate::kv::snapshot_from_pairs;
use crate::provider::{ConfigProvider, Snapshot};
use crate::types::{Database, Device, Global, Producer, Sensor};

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Configuration stored under a Consul KV prefix, watched with blocking
/// queries.
pub struct ConsulConfig {
    client: reqwest::Client,
    address: String,
    prefix: String,
    snapshot: RwLock<Arc<Snapshot>>,
    informer: Arc<Notify>,
}

impl ConsulConfig {
    pub async fn new(address: &str, prefix: &str) -> Result<Arc<Self>, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConfigError::Kv(e.to_string()))?;

        let provider = Arc::new(Self {
            client,
            address: address.trim_end_matches('/').to_owned(),
            prefix: prefix.to_owned(),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            informer: Arc::new(Notify::new()),
        });

        provider.update().await?;
        provider.clone().watch();

        Ok(provider)
    }

    async fn fetch(&self, wait_index: Option<u64>) -> Result<(Vec<KvPair>, u64), ConfigError> {
        let mut url = format!(
            "{}/v1/kv/{}?recurse=true",
            self.address,
            self.prefix.trim_end_matches('/')
        );
        if let Some(index) = wait_index {
            url.push_str(&format!("&index={index}&wait=5m"));
        }

        let request = self.client.get(&url);
        let request = if wait_index.is_some() {
            // Blocking queries outlive the default client timeout.
            request.timeout(Duration::from_secs(330))
        } else {
            request
        };

        let response = request
            .send()
            .await
            .map_err(|e| ConfigError::Kv(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConfigError::Kv(format!(
                "consul list failed: {}",
                response.status()
            )));
        }

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let pairs: Vec<KvPair> = response
            .json()
            .await
            .map_err(|e| ConfigError::Kv(e.to_string()))?;

        Ok((pairs, index))
    }

    async fn load(&self) -> Result<Snapshot, ConfigError> {
        let (pairs, _) = self.fetch(None).await?;
        let prefix = self.prefix.clone();

        let decoded = pairs
            .into_iter()
            .map(|p| {
                let value = match p.value {
                    Some(v) => base64::engine::general_purpose::STANDARD
                        .decode(v)
                        .map_err(|e| ConfigError::Parse(e.to_string()))?,
                    None => Vec::new(),
                };
                let key = p.key.strip_prefix(prefix.as_str()).unwrap_or(&p.key);
                Ok((key.trim_end_matches('/').to_owned(), value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        snapshot_from_pairs(decoded, "consul")
    }

    fn watch(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut index = 0u64;
            loop {
                match self.fetch(Some(index)).await {
                    Ok((_, new_index)) => {
                        if new_index != index {
                            if index != 0 {
                                info!(prefix = %self.prefix, "consul watcher triggered");
                                self.informer.notify_one();
                            }
                            index = new_index;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "consul watcher");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }
}

#[async_trait]
impl ConfigProvider for ConsulConfig {
    fn devices(&self) -> Vec<Device> {
        self.current().devices.clone()
    }

    fn sensors(&self) -> Vec<Sensor> {
        self.current().sensors.clone()
    }

    fn producers(&self) -> Vec<Producer> {
        self.current().producers.clone()
    }

    fn databases(&self) -> Vec<Database> {
        self.current().databases.clone()
    }

    fn global(&self) -> Global {
        self.current().global.clone()
    }

    fn informer(&self) -> Arc<Notify> {
        self.informer.clone()
    }

    async fn update(&self) -> Result<(), ConfigError> {
        let snapshot = self.load().await?;
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
        Ok(())
    }
}
