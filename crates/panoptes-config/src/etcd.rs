//! etcd KV provider.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, WatchOptions};
use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::ConfigError;
use crate::kv::snapshot_from_pairs;
use crate::provider::{ConfigProvider, Snapshot};
use crate::types::{Database, Device, Global, Producer, Sensor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration stored under an etcd prefix, watched with prefix
/// semantics.
pub struct EtcdConfig {
    client: Client,
    prefix: String,
    snapshot: RwLock<Arc<Snapshot>>,
    informer: Arc<Notify>,
}

impl EtcdConfig {
    pub async fn new(endpoint: &str, prefix: &str) -> Result<Arc<Self>, ConfigError> {
        let client = Client::connect([endpoint], None)
            .await
            .map_err(|e| ConfigError::Kv(e.to_string()))?;

        let provider = Arc::new(Self {
            client,
            prefix: prefix.to_owned(),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            informer: Arc::new(Notify::new()),
        });

        provider.update().await?;
        provider.clone().watch();

        Ok(provider)
    }

    async fn load(&self) -> Result<Snapshot, ConfigError> {
        let mut kv = self.client.kv_client();
        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            kv.get(
                self.prefix.as_str(),
                Some(GetOptions::new().with_prefix()),
            ),
        )
        .await
        .map_err(|_| ConfigError::Kv("etcd get timed out".into()))?
        .map_err(|e| ConfigError::Kv(e.to_string()))?;

        let pairs = response
            .kvs()
            .iter()
            .map(|kv| {
                let key = kv
                    .key_str()
                    .map_err(|e| ConfigError::Parse(e.to_string()))?;
                let key = key.strip_prefix(self.prefix.as_str()).unwrap_or(key);
                Ok((
                    key.trim_end_matches('/').to_owned(),
                    kv.value().to_vec(),
                ))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        snapshot_from_pairs(pairs, "etcd")
    }

    fn watch(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let mut watch_client = self.client.watch_client();
                let stream = watch_client
                    .watch(
                        self.prefix.as_str(),
                        Some(WatchOptions::new().with_prefix()),
                    )
                    .await;

                let (_watcher, mut stream) = match stream {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "etcd watcher");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                loop {
                    match stream.message().await {
                        Ok(Some(response)) => {
                            if !response.events().is_empty() {
                                info!(prefix = %self.prefix, "etcd watcher triggered");
                                self.informer.notify_one();
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!(error = %err, "etcd watcher");
                            break;
                        }
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
impl ConfigProvider for EtcdConfig {
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
