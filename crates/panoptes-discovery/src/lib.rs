//! Cluster membership.
//!
//! Each panoptes instance registers itself with a discovery backend under
//! the lowest free non-negative integer id, heartbeats a lease, and watches
//! the membership set. The shard coordinator partitions the device set over
//! the registered instances.

pub mod consul;
pub mod error;
pub mod etcd;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use panoptes_config::ConfigProvider;

pub use error::DiscoveryError;

/// One registered panoptes instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Instance {
    /// Small non-negative integer, unique within the cluster.
    pub id: String,
    /// The registering host's name.
    pub address: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// `passing` or `failing`.
    pub status: String,
}

/// A discovery backend.
///
/// `register` claims an id under a distributed lock (held only for the
/// duration of the call), writes the instance record with a lease, and
/// starts heart-beating. `watch` posts one token per membership change,
/// dropped when the receiver's slot is full.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self) -> Result<(), DiscoveryError>;
    async fn deregister(&self) -> Result<(), DiscoveryError>;
    async fn get_instances(&self) -> Result<Vec<Instance>, DiscoveryError>;
    fn watch(&self, notify: mpsc::Sender<()>);
}

/// Constructs the backend named in `global.discovery.service`, registering
/// this instance. Returns `None` when discovery is disabled.
pub async fn register(
    cfg: Arc<dyn ConfigProvider>,
) -> Result<Option<Arc<dyn Discovery>>, DiscoveryError> {
    let discovery: Arc<dyn Discovery> = match cfg.global().discovery.service.as_str() {
        "consul" => consul::ConsulDiscovery::new(cfg).await?,
        "etcd" => etcd::EtcdDiscovery::new(cfg).await?,
        "" => {
            info!("discovery disabled");
            return Ok(None);
        }
        other => return Err(DiscoveryError::UnknownBackend(other.to_owned())),
    };

    discovery.register().await?;

    Ok(Some(discovery))
}

/// Metadata every instance publishes with its record.
pub(crate) fn instance_meta(cfg: &dyn ConfigProvider) -> HashMap<String, String> {
    let global = cfg.global();
    let mut meta = HashMap::new();
    meta.insert(
        "shard_enabled".to_owned(),
        global.shards.enabled.to_string(),
    );
    meta.insert(
        "shard_nodes".to_owned(),
        global.shards.number_of_nodes.to_string(),
    );
    meta.insert("version".to_owned(), global.version);
    meta
}

/// The local host name, used as the instance address and recovery key.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Returns the lowest non-negative integer not present in `ids`.
pub(crate) fn next_id(mut ids: Vec<u64>) -> String {
    ids.sort_unstable();
    for (i, id) in ids.iter().enumerate() {
        if i as u64 != *id {
            return i.to_string();
        }
    }
    ids.len().to_string()
}
