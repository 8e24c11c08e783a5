//! Consul discovery backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use panoptes_config::ConfigProvider;

use crate::error::DiscoveryError;
use crate::{hostname, instance_meta, next_id, Discovery, Instance};

const SERVICE_NAME: &str = "panoptes";
const LOCK_KEY: &str = "panoptes_global_lock";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConsulSettings {
    address: String,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ServiceRegistration {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    check: TtlCheck,
}

#[derive(Debug, Serialize)]
struct TtlCheck {
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: String,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
    #[serde(rename = "Checks")]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "Status")]
    status: String,
}

pub struct ConsulDiscovery {
    client: reqwest::Client,
    cfg: Arc<dyn ConfigProvider>,
    address: String,
    id: RwLock<Option<String>>,
}

impl ConsulDiscovery {
    pub async fn new(cfg: Arc<dyn ConfigProvider>) -> Result<Arc<Self>, DiscoveryError> {
        let global = cfg.global();
        let settings: ConsulSettings = if global.discovery.config.is_null() {
            ConsulSettings::default()
        } else {
            serde_json::from_value(global.discovery.config.clone())
                .map_err(|e| DiscoveryError::Parse(e.to_string()))?
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Arc::new(Self {
            client,
            cfg,
            address: settings.address.trim_end_matches('/').to_owned(),
            id: RwLock::new(None),
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.address, path)
    }

    async fn register_locked(&self) -> Result<(), DiscoveryError> {
        let meta = instance_meta(self.cfg.as_ref());
        let host = hostname();

        let mut ids = Vec::new();
        for instance in self.get_instances().await? {
            match instance.id.parse::<u64>() {
                Ok(id) => ids.push(id),
                Err(err) => {
                    warn!(id = %instance.id, error = %err, "consul.register");
                    continue;
                }
            }

            if instance.address == host {
                self.put_service(&instance.id, &meta).await?;
                info!(id = %instance.id, "consul service registry recovered");
                return Ok(());
            }
        }

        let id = next_id(ids);
        self.put_service(&id, &meta).await?;
        info!(id = %id, "consul service registered");

        Ok(())
    }

    async fn put_service(
        &self,
        id: &str,
        meta: &HashMap<String, String>,
    ) -> Result<(), DiscoveryError> {
        let registration = ServiceRegistration {
            name: SERVICE_NAME.to_owned(),
            id: id.to_owned(),
            address: hostname(),
            meta: meta.clone(),
            check: TtlCheck {
                ttl: "60s".to_owned(),
                deregister_after: "90m".to_owned(),
            },
        };

        let response = self
            .client
            .put(self.url("/agent/service/register"))
            .json(&registration)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Backend(format!(
                "consul registration failed: {}",
                response.status()
            )));
        }

        *self.id.write().await = Some(id.to_owned());
        self.heartbeat(id.to_owned());

        Ok(())
    }

    /// Passes the TTL check so the instance stays `passing`.
    fn heartbeat(&self, id: String) {
        let client = self.client.clone();
        let url = self.url(&format!("/agent/check/pass/service:{id}"));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                match client.put(&url).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        error!(status = %response.status(), "consul heartbeat rejected");
                    }
                    Err(err) => error!(error = %err, "consul heartbeat"),
                }
            }
        });
    }

    /// Acquires the cluster lock through a short-lived session.
    async fn lock(&self) -> Result<String, DiscoveryError> {
        #[derive(Deserialize)]
        struct SessionResponse {
            #[serde(rename = "ID")]
            id: String,
        }

        let session: SessionResponse = self
            .client
            .put(self.url("/session/create"))
            .json(&serde_json::json!({"Name": LOCK_KEY, "TTL": "30s"}))
            .send()
            .await?
            .json()
            .await?;

        loop {
            let acquired: bool = self
                .client
                .put(self.url(&format!("/kv/{LOCK_KEY}?acquire={}", session.id)))
                .body(hostname())
                .send()
                .await?
                .json()
                .await?;

            if acquired {
                return Ok(session.id);
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn unlock(&self, session_id: &str) {
        let release = self
            .client
            .put(self.url(&format!("/kv/{LOCK_KEY}?release={session_id}")))
            .send()
            .await;
        if let Err(err) = release {
            warn!(error = %err, "consul lock release");
        }

        let destroy = self
            .client
            .put(self.url(&format!("/session/destroy/{session_id}")))
            .send()
            .await;
        if let Err(err) = destroy {
            warn!(error = %err, "consul session destroy");
        }
    }
}

#[async_trait]
impl Discovery for ConsulDiscovery {
    async fn register(&self) -> Result<(), DiscoveryError> {
        let session_id = self.lock().await?;
        let result = self.register_locked().await;
        self.unlock(&session_id).await;
        result
    }

    async fn deregister(&self) -> Result<(), DiscoveryError> {
        let id = self.id.write().await.take();
        let Some(id) = id else {
            return Err(DiscoveryError::NotRegistered);
        };

        let response = self
            .client
            .put(self.url(&format!("/agent/service/deregister/{id}")))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Backend(format!(
                "consul deregistration failed: {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn get_instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let entries: Vec<HealthEntry> = self
            .client
            .get(self.url(&format!("/health/service/{SERVICE_NAME}")))
            .send()
            .await?
            .json()
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let passing = entry.checks.iter().all(|c| c.status == "passing");
                Instance {
                    id: entry.service.id,
                    address: entry.service.address,
                    meta: entry.service.meta,
                    status: if passing { "passing" } else { "failing" }.to_owned(),
                }
            })
            .collect())
    }

    fn watch(&self, notify: mpsc::Sender<()>) {
        let client = self.client.clone();
        let url = self.url(&format!("/health/service/{SERVICE_NAME}"));

        tokio::spawn(async move {
            let mut index = 0u64;
            loop {
                let request = client
                    .get(format!("{url}?index={index}&wait=5m"))
                    .timeout(Duration::from_secs(330));

                match request.send().await {
                    Ok(response) => {
                        let new_index = response
                            .headers()
                            .get("X-Consul-Index")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse().ok())
                            .unwrap_or_default();

                        if new_index != index {
                            if index != 0 {
                                info!("consul membership changed");
                                let _ = notify.try_send(());
                            }
                            index = new_index;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "consul membership watcher");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }
}
