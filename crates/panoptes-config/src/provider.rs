//! The provider trait and the backend factory.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::consul::ConsulConfig;
use crate::error::ConfigError;
use crate::etcd::EtcdConfig;
use crate::types::{Database, Device, Global, Producer, Sensor};
use crate::yaml::YamlConfig;

/// An immutable view of one loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub sensors: Vec<Sensor>,
    pub producers: Vec<Producer>,
    pub databases: Vec<Database>,
    pub global: Global,
}

/// The source of truth driving the supervisor, demux, and shard coordinator.
///
/// Accessors return data from the snapshot current at call time; `update`
/// atomically replaces the snapshot and on failure leaves the previous one
/// intact. The informer is a lossy single-token signal: any number of
/// external change events within one cycle coalesce into one wake-up, and
/// consumers must call `update` themselves.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    fn devices(&self) -> Vec<Device>;
    fn sensors(&self) -> Vec<Sensor>;
    fn producers(&self) -> Vec<Producer>;
    fn databases(&self) -> Vec<Database>;
    fn global(&self) -> Global;
    fn informer(&self) -> Arc<Notify>;
    async fn update(&self) -> Result<(), ConfigError>;
}

/// Builds a provider from a `--config` argument.
///
/// `consul://host:8500/prefix/` and `etcd://host:2379/prefix/` select the
/// KV backends; anything else is a YAML file path.
pub async fn new_provider(source: &str) -> Result<Arc<dyn ConfigProvider>, ConfigError> {
    if let Some(rest) = source.strip_prefix("consul://") {
        let (address, prefix) = split_kv_source(rest);
        return Ok(ConsulConfig::new(&format!("http://{address}"), prefix).await?);
    }

    if let Some(rest) = source.strip_prefix("etcd://") {
        let (address, prefix) = split_kv_source(rest);
        return Ok(EtcdConfig::new(&format!("http://{address}"), prefix).await?);
    }

    Ok(YamlConfig::new(source)?)
}

fn split_kv_source(rest: &str) -> (&str, &str) {
    match rest.split_once('/') {
        Some((address, prefix)) if !prefix.is_empty() => (address, prefix),
        _ => (rest.trim_end_matches('/'), "panoptes/config/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_source_splits_address_and_prefix() {
        assert_eq!(
            split_kv_source("127.0.0.1:8500/panoptes/"),
            ("127.0.0.1:8500", "panoptes/")
        );
        assert_eq!(
            split_kv_source("127.0.0.1:2379"),
            ("127.0.0.1:2379", "panoptes/config/")
        );
    }
}
