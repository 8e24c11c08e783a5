//! YAML file provider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::ConfigError;
use crate::provider::{ConfigProvider, Snapshot};
use crate::types::{
    synthesize_devices, Database, Device, DeviceTemplate, Global, Producer, Sensor,
};

/// Shape of the top-level YAML document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlFile {
    devices: Vec<DeviceTemplate>,
    sensors: HashMap<String, Sensor>,
    producers: HashMap<String, SinkFile>,
    databases: HashMap<String, SinkFile>,

    #[serde(flatten)]
    global: Global,
}

/// A producer/database entry pointing at its own config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SinkFile {
    service: String,
    config_file: String,
}

/// File-backed configuration, reloaded wholesale on every `update`.
pub struct YamlConfig {
    path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    informer: Arc<Notify>,
    // Watcher threads stop when this is dropped with the provider.
    _watcher: Option<std::sync::Mutex<RecommendedWatcher>>,
}

impl YamlConfig {
    pub fn new(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load(&path)?;
        let informer = Arc::new(Notify::new());

        let watcher = if snapshot.global.watcher_disabled {
            None
        } else {
            Some(std::sync::Mutex::new(watch(&path, informer.clone())?))
        };

        Ok(Arc::new(Self {
            path,
            snapshot: RwLock::new(Arc::new(snapshot)),
            informer,
            _watcher: watcher,
        }))
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }
}

#[async_trait]
impl ConfigProvider for YamlConfig {
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
        let snapshot = load(&self.path)?;
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
        Ok(())
    }
}

fn load(path: &Path) -> Result<Snapshot, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let file: YamlFile = serde_yaml::from_str(&raw)?;

    let valid: HashMap<String, Sensor> = file
        .sensors
        .iter()
        .filter(|(_, s)| match crate::types::sensor_validation(s) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "sensor skipped");
                false
            }
        })
        .map(|(name, s)| (name.clone(), s.clone()))
        .collect();

    let sensors: Vec<Sensor> = valid.values().cloned().collect();
    let devices = synthesize_devices(&file.devices, &valid);

    let mut producers = load_sinks(&file.producers, |name, service, config| Producer {
        name,
        service,
        config,
    })?;
    // The console producer is always available.
    producers.push(Producer {
        name: "console".to_owned(),
        service: "console".to_owned(),
        config: serde_json::Value::Null,
    });

    let databases = load_sinks(&file.databases, |name, service, config| Database {
        name,
        service,
        config,
    })?;

    let mut global = file.global;
    if !global.discovery.config_file.is_empty() {
        let raw = std::fs::read_to_string(&global.discovery.config_file)?;
        global.discovery.config = serde_yaml::from_str(&raw)?;
    }

    Ok(Snapshot {
        devices,
        sensors,
        producers,
        databases,
        global,
    })
}

fn load_sinks<T>(
    sinks: &HashMap<String, SinkFile>,
    build: impl Fn(String, String, serde_json::Value) -> T,
) -> Result<Vec<T>, ConfigError> {
    let mut out = Vec::with_capacity(sinks.len());

    for (name, sink) in sinks {
        let config = if sink.config_file.is_empty() {
            serde_json::Value::Null
        } else {
            let raw = std::fs::read_to_string(&sink.config_file)?;
            serde_yaml::from_str(&raw)?
        };

        out.push(build(name.clone(), sink.service.clone(), config));
    }

    Ok(out)
}

fn watch(path: &Path, informer: Arc<Notify>) -> Result<RecommendedWatcher, ConfigError> {
    let name = path.display().to_string();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_modify() {
                    info!(name = %name, "watcher.loop");
                    informer.notify_one();
                }
            }
            Err(err) => error!(error = %err, "watcher.loop"),
        })
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

    Ok(watcher)
}
