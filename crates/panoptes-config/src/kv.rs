//! Snapshot assembly shared by the KV-backed providers.
//!
//! Consul and etcd lay the configuration out identically: under the
//! configured prefix, the sub-prefixes `devices/`, `sensors/`, `producers/`,
//! and `databases/` plus the single key `global`, each value a JSON document
//! of the same shape as its YAML counterpart.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::error;

use crate::error::ConfigError;
use crate::provider::Snapshot;
use crate::types::{
    sensor_validation, synthesize_devices, Database, DeviceTemplate, Global, Producer, Sensor,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KvSink {
    service: String,
    config: serde_json::Value,
}

/// Assembles a snapshot from `(key, value)` pairs, keys relative to the
/// prefix. Folder keys (empty values) are ignored.
pub(crate) fn snapshot_from_pairs(
    pairs: impl IntoIterator<Item = (String, Vec<u8>)>,
    source: &str,
) -> Result<Snapshot, ConfigError> {
    let mut templates: Vec<DeviceTemplate> = Vec::new();
    let mut sensors: HashMap<String, Sensor> = HashMap::new();
    let mut producers: Vec<Producer> = Vec::new();
    let mut databases: Vec<Database> = Vec::new();
    let mut global = Global::default();
    let mut seen = false;

    for (key, value) in pairs {
        if value.is_empty() {
            continue;
        }
        seen = true;

        let (folder, name) = match key.rsplit_once('/') {
            Some((folder, name)) => (folder, name),
            None => ("", key.as_str()),
        };

        match folder {
            "devices" => {
                let template: DeviceTemplate = serde_json::from_slice(&value)?;
                templates.push(template);
            }
            "sensors" => {
                let sensor: Sensor = serde_json::from_slice(&value)?;
                match sensor_validation(&sensor) {
                    Ok(()) => {
                        sensors.insert(name.to_owned(), sensor);
                    }
                    Err(err) => error!(sensor = %name, error = %err, "sensor skipped"),
                }
            }
            "producers" => {
                let sink: KvSink = serde_json::from_slice(&value)?;
                producers.push(Producer {
                    name: name.to_owned(),
                    service: sink.service,
                    config: sink.config,
                });
            }
            "databases" => {
                let sink: KvSink = serde_json::from_slice(&value)?;
                databases.push(Database {
                    name: name.to_owned(),
                    service: sink.service,
                    config: sink.config,
                });
            }
            "" if name == "global" => {
                global = serde_json::from_slice(&value)?;
            }
            _ => {}
        }
    }

    if !seen {
        return Err(ConfigError::Empty(source.to_owned()));
    }

    let devices = synthesize_devices(&templates, &sensors);
    let sensor_list: Vec<Sensor> = sensors.into_values().collect();

    producers.push(Producer {
        name: "console".to_owned(),
        service: "console".to_owned(),
        config: serde_json::Value::Null,
    });

    Ok(Snapshot {
        devices,
        sensors: sensor_list,
        producers,
        databases,
        global,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &str, value: serde_json::Value) -> (String, Vec<u8>) {
        (key.to_owned(), serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn assembles_snapshot_from_pairs() {
        let pairs = vec![
            // folder key
            ("devices/".to_owned(), Vec::new()),
            pair(
                "devices/core1.lax",
                serde_json::json!({"host": "core1.lax", "port": 50051, "sensors": ["ifc"]}),
            ),
            pair(
                "sensors/ifc",
                serde_json::json!({
                    "service": "juniper.gnmi",
                    "path": "/interfaces/",
                    "mode": "sample",
                    "sample_interval": 10,
                    "output": "console::stdout"
                }),
            ),
            pair(
                "producers/kafka1",
                serde_json::json!({"service": "mqtt", "config": {"broker": "localhost"}}),
            ),
            pair("global", serde_json::json!({"buffer_size": 8})),
        ];

        let snapshot = snapshot_from_pairs(pairs, "test").unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].host(), "core1.lax");
        assert_eq!(snapshot.sensors.len(), 1);
        // kafka1 plus the built-in console
        assert_eq!(snapshot.producers.len(), 2);
        assert_eq!(snapshot.global.buffer_size, 8);
    }

    #[test]
    fn empty_store_is_an_error() {
        let pairs = vec![("devices/".to_owned(), Vec::new())];
        assert!(matches!(
            snapshot_from_pairs(pairs, "test"),
            Err(ConfigError::Empty(_))
        ));
    }
}
