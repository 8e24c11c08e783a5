//! In-memory provider for tests.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::ConfigError;
use crate::provider::{ConfigProvider, Snapshot};
use crate::types::{Database, Device, Global, Producer, Sensor};

/// A provider whose snapshot is set directly by the test.
#[derive(Default)]
pub struct MockConfig {
    snapshot: RwLock<Snapshot>,
    informer: Arc<Notify>,
    fail_update: RwLock<bool>,
}

impl MockConfig {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        self.snapshot.write().unwrap().devices = devices;
    }

    pub fn set_producers(&self, producers: Vec<Producer>) {
        self.snapshot.write().unwrap().producers = producers;
    }

    pub fn set_databases(&self, databases: Vec<Database>) {
        self.snapshot.write().unwrap().databases = databases;
    }

    pub fn set_global(&self, global: Global) {
        self.snapshot.write().unwrap().global = global;
    }

    /// Makes subsequent `update` calls fail.
    pub fn fail_updates(&self, fail: bool) {
        *self.fail_update.write().unwrap() = fail;
    }
}

#[async_trait]
impl ConfigProvider for MockConfig {
    fn devices(&self) -> Vec<Device> {
        self.snapshot.read().unwrap().devices.clone()
    }

    fn sensors(&self) -> Vec<Sensor> {
        self.snapshot.read().unwrap().sensors.clone()
    }

    fn producers(&self) -> Vec<Producer> {
        self.snapshot.read().unwrap().producers.clone()
    }

    fn databases(&self) -> Vec<Database> {
        self.snapshot.read().unwrap().databases.clone()
    }

    fn global(&self) -> Global {
        self.snapshot.read().unwrap().global.clone()
    }

    fn informer(&self) -> Arc<Notify> {
        self.informer.clone()
    }

    async fn update(&self) -> Result<(), ConfigError> {
        if *self.fail_update.read().unwrap() {
            return Err(ConfigError::Kv("mock update failure".into()));
        }
        Ok(())
    }
}
