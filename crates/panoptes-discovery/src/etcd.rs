//! etcd discovery backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions, WatchOptions};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use panoptes_config::ConfigProvider;

use crate::error::DiscoveryError;
use crate::{hostname, instance_meta, next_id, Discovery, Instance};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const LEASE_TTL_SECS: i64 = 60;
const LOCK_NAME: &str = "panoptes_global_lock";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EtcdSettings {
    endpoints: Vec<String>,
}

impl Default for EtcdSettings {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_owned()],
        }
    }
}

pub struct EtcdDiscovery {
    client: Client,
    cfg: Arc<dyn ConfigProvider>,
    prefix: String,
    id: RwLock<Option<String>>,
    lease: RwLock<Option<i64>>,
}

impl EtcdDiscovery {
    pub async fn new(cfg: Arc<dyn ConfigProvider>) -> Result<Arc<Self>, DiscoveryError> {
        let global = cfg.global();
        let settings: EtcdSettings = if global.discovery.config.is_null() {
            EtcdSettings::default()
        } else {
            serde_json::from_value(global.discovery.config.clone())
                .map_err(|e| DiscoveryError::Parse(e.to_string()))?
        };

        let client = Client::connect(settings.endpoints, None).await?;

        Ok(Arc::new(Self {
            client,
            cfg,
            prefix: global.discovery.prefix,
            id: RwLock::new(None),
            lease: RwLock::new(None),
        }))
    }

    /// Claims or recovers an id; the caller holds the cluster lock.
    async fn register_locked(&self) -> Result<(), DiscoveryError> {
        let meta = instance_meta(self.cfg.as_ref());
        let host = hostname();

        let mut ids = Vec::new();
        for instance in self.get_instances().await? {
            match instance.id.parse::<u64>() {
                Ok(id) => ids.push(id),
                Err(err) => {
                    warn!(id = %instance.id, error = %err, "etcd.register");
                    continue;
                }
            }

            if instance.address == host {
                // A record for this host already exists; resume under it.
                self.put_instance(&instance.id, &meta).await?;
                info!(id = %instance.id, "service registry recovered");
                return Ok(());
            }
        }

        let id = next_id(ids);
        self.put_instance(&id, &meta).await?;
        info!(id = %id, "service registered");

        Ok(())
    }

    async fn put_instance(
        &self,
        id: &str,
        meta: &std::collections::HashMap<String, String>,
    ) -> Result<(), DiscoveryError> {
        let instance = Instance {
            id: id.to_owned(),
            address: hostname(),
            meta: meta.clone(),
            status: "passing".to_owned(),
        };

        let mut lease_client = self.client.lease_client();
        let lease = tokio::time::timeout(
            REQUEST_TIMEOUT,
            lease_client.grant(LEASE_TTL_SECS, None),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout)??;

        let key = format!("{}{}", self.prefix, id);
        let value =
            serde_json::to_vec(&instance).map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        let mut kv = self.client.kv_client();
        tokio::time::timeout(
            REQUEST_TIMEOUT,
            kv.put(key, value, Some(PutOptions::new().with_lease(lease.id()))),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout)??;

        *self.id.write().await = Some(id.to_owned());
        *self.lease.write().await = Some(lease.id());

        self.heartbeat(lease.id());

        Ok(())
    }

    /// Keeps the registration lease alive until it is revoked.
    fn heartbeat(&self, lease_id: i64) {
        let mut lease_client = self.client.lease_client();
        tokio::spawn(async move {
            let (mut keeper, mut stream) = match lease_client.keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "etcd keepalive setup");
                    return;
                }
            };

            let mut ticker = tokio::time::interval(Duration::from_secs(20));
            loop {
                ticker.tick().await;
                if let Err(err) = keeper.keep_alive().await {
                    error!(error = %err, "etcd keepalive");
                    return;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        error!("etcd keepalive stream closed");
                        return;
                    }
                    Err(err) => {
                        error!(error = %err, "etcd keepalive");
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Discovery for EtcdDiscovery {
    async fn register(&self) -> Result<(), DiscoveryError> {
        // The lock spans list-and-put so two peers cannot claim one id.
        let mut lock_client = self.client.lock_client();
        let lock = tokio::time::timeout(REQUEST_TIMEOUT, lock_client.lock(LOCK_NAME, None))
            .await
            .map_err(|_| DiscoveryError::Timeout)??;

        let result = self.register_locked().await;

        if let Err(err) =
            tokio::time::timeout(REQUEST_TIMEOUT, lock_client.unlock(lock.key().to_vec())).await
        {
            warn!(error = %err, "etcd unlock");
        }

        result
    }

    async fn deregister(&self) -> Result<(), DiscoveryError> {
        let lease = self.lease.write().await.take();
        let Some(lease_id) = lease else {
            return Err(DiscoveryError::NotRegistered);
        };

        let mut lease_client = self.client.lease_client();
        tokio::time::timeout(REQUEST_TIMEOUT, lease_client.revoke(lease_id))
            .await
            .map_err(|_| DiscoveryError::Timeout)??;

        Ok(())
    }

    async fn get_instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let mut kv = self.client.kv_client();
        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            kv.get(
                self.prefix.as_str(),
                Some(GetOptions::new().with_prefix()),
            ),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout)??;

        let mut instances = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<Instance>(kv.value()) {
                Ok(instance) => instances.push(instance),
                Err(err) => warn!(error = %err, "etcd instance record skipped"),
            }
        }

        Ok(instances)
    }

    fn watch(&self, notify: mpsc::Sender<()>) {
        let client = self.client.clone();
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            loop {
                let mut watch_client = client.watch_client();
                let stream = watch_client
                    .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                    .await;

                let (_watcher, mut stream) = match stream {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "etcd membership watcher");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                loop {
                    match stream.message().await {
                        Ok(Some(response)) if !response.events().is_empty() => {
                            info!("etcd membership changed");
                            if notify.try_send(()).is_err() {
                                // Coalesced; a rebalance is already pending.
                            }
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(err) => {
                            error!(error = %err, "etcd membership watcher");
                            break;
                        }
                    }
                }
            }
        });
    }
}
