//! Configuration model and providers.
//!
//! A [`ConfigProvider`] is the source of truth driving the supervisor, the
//! demultiplexer, and the shard coordinator. Three backends exist: a YAML
//! file (watched for writes), Consul KV, and etcd KV. All of them rebuild
//! the device/sensor/producer/database slices wholesale on [`ConfigProvider::update`]
//! and publish the result as an immutable snapshot; consumers only ever see
//! complete snapshots.

pub mod consul;
pub mod error;
pub mod etcd;
mod kv;
pub mod provider;
pub mod types;
pub mod yaml;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::ConfigError;
pub use provider::{new_provider, ConfigProvider, Snapshot};
pub use types::{
    Database, Device, DeviceConfig, DeviceTemplate, DialoutService, DiscoveryConfig, Global,
    Producer, Sensor, ShardConfig, StatusConfig, TlsConfig,
};
