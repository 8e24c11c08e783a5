//! Configuration model shared across the pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// A subscription request template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sensor {
    /// Which protocol driver carries this sensor (e.g. `juniper.gnmi`).
    pub service: String,
    /// Provider-specific schema path.
    pub path: String,
    /// `target_defined`, `sample`, or `on_change`.
    pub mode: String,
    /// Sampling interval in seconds.
    pub sample_interval: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval: u64,
    pub suppress_redundant: bool,
    /// `"<sink_name>::<stream>"`, optionally suffixed `::raw`.
    pub output: String,
    pub disabled: bool,
}

/// Transport and credential settings shared by templates and devices.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    /// Dial timeout in seconds; zero means the transport default.
    pub timeout: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_config: Option<TlsConfig>,
}

/// A device entry as written in configuration: transport settings plus
/// sensor references by name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTemplate {
    #[serde(flatten)]
    pub config: DeviceConfig,
    pub sensors: Vec<String>,
}

/// A fully-resolved target: transport settings plus sensors grouped by the
/// driver service that will carry them on this device's connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Device {
    pub config: DeviceConfig,
    pub sensors: HashMap<String, Vec<Sensor>>,
}

impl Device {
    /// The device's identity key, stable across config reloads.
    pub fn host(&self) -> &str {
        &self.config.host
    }
}

/// TLS settings for a device or sink connection. File fields accept the
/// `__<engine>::<path>` remote-secret syntax.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
}

/// A producer sink descriptor. `config` is an opaque sub-tree handed to the
/// sink untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Producer {
    pub name: String,
    pub service: String,
    pub config: serde_json::Value,
}

/// A database sink descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub name: String,
    pub service: String,
    pub config: serde_json::Value,
}

/// Process-wide settings, inline at the top level of the config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    /// Depth of the inter-component record channel.
    pub buffer_size: usize,
    pub version: String,
    pub shards: ShardConfig,
    pub discovery: DiscoveryConfig,
    pub status: StatusConfig,
    pub dialout: DialoutConfig,
    pub watcher_disabled: bool,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            version: String::new(),
            shards: ShardConfig::default(),
            discovery: DiscoveryConfig::default(),
            status: StatusConfig::default(),
            dialout: DialoutConfig::default(),
            watcher_disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub enabled: bool,
    /// Minimum peer count assumed for the ownership modulus.
    pub number_of_nodes: usize,
    /// Peer count source.
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// `consul`, `etcd`, or empty for none.
    pub service: String,
    pub prefix: String,
    /// Optional YAML file holding the backend's own settings.
    pub config_file: String,
    /// Backend settings, either loaded from `config_file` or inline.
    pub config: serde_json::Value,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            prefix: "panoptes/".to_owned(),
            config_file: String::new(),
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub disabled: bool,
    pub addr: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            addr: "0.0.0.0:8081".to_owned(),
        }
    }
}

/// Dial-out collectors: service name to listen address.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialoutConfig {
    pub services: HashMap<String, DialoutService>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialoutService {
    pub addr: String,
}

/// Validates a sensor template. Sampling mode requires a positive interval.
pub fn sensor_validation(sensor: &Sensor) -> Result<(), ConfigError> {
    if sensor.service.is_empty() {
        return Err(ConfigError::Validation("sensor service is empty".into()));
    }

    if sensor.path.is_empty() {
        return Err(ConfigError::Validation("sensor path is empty".into()));
    }

    match sensor.mode.as_str() {
        "sample" => {
            if sensor.sample_interval == 0 {
                return Err(ConfigError::Validation(format!(
                    "sensor {}: sample mode requires sample_interval > 0",
                    sensor.path
                )));
            }
        }
        "" | "target_defined" | "on_change" => {}
        other => {
            return Err(ConfigError::Validation(format!(
                "sensor {}: unknown mode {other}",
                sensor.path
            )));
        }
    }

    Ok(())
}

/// Validates a resolved device.
pub fn device_validation(device: &Device) -> Result<(), ConfigError> {
    if device.config.host.is_empty() {
        return Err(ConfigError::Validation("device host is empty".into()));
    }

    Ok(())
}

/// Resolves device templates against the named sensor set.
///
/// Unresolved sensor references and invalid devices are skipped with a
/// warning rather than failing the whole snapshot.
pub fn synthesize_devices(
    templates: &[DeviceTemplate],
    sensors: &HashMap<String, Sensor>,
) -> Vec<Device> {
    let mut devices = Vec::with_capacity(templates.len());

    for template in templates {
        let mut device = Device {
            config: template.config.clone(),
            sensors: HashMap::new(),
        };

        for name in &template.sensors {
            let Some(sensor) = sensors.get(name) else {
                warn!(sensor = %name, host = %template.config.host, "sensor not exist");
                continue;
            };

            if sensor.disabled {
                continue;
            }

            device
                .sensors
                .entry(sensor.service.clone())
                .or_default()
                .push(sensor.clone());
        }

        if let Err(err) = device_validation(&device) {
            warn!(error = %err, "device skipped");
            continue;
        }

        devices.push(device);
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sensor(service: &str) -> Sensor {
        Sensor {
            service: service.to_owned(),
            path: "/interfaces/".to_owned(),
            mode: "sample".to_owned(),
            sample_interval: 10,
            output: "console::stdout".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn sample_mode_requires_interval() {
        let mut sensor = sample_sensor("juniper.gnmi");
        assert!(sensor_validation(&sensor).is_ok());

        sensor.sample_interval = 0;
        assert!(sensor_validation(&sensor).is_err());

        sensor.mode = "on_change".to_owned();
        assert!(sensor_validation(&sensor).is_ok());

        sensor.mode = "bogus".to_owned();
        assert!(sensor_validation(&sensor).is_err());
    }

    #[test]
    fn synthesis_skips_unresolved_and_disabled() {
        let mut sensors = HashMap::new();
        sensors.insert("ifcounters".to_owned(), sample_sensor("juniper.gnmi"));
        sensors.insert(
            "bgp".to_owned(),
            Sensor {
                disabled: true,
                ..sample_sensor("juniper.jti")
            },
        );

        let templates = vec![DeviceTemplate {
            config: DeviceConfig {
                host: "core1.lax".to_owned(),
                port: 50051,
                ..Default::default()
            },
            sensors: vec![
                "ifcounters".to_owned(),
                "bgp".to_owned(),
                "missing".to_owned(),
            ],
        }];

        let devices = synthesize_devices(&templates, &sensors);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].host(), "core1.lax");
        assert_eq!(devices[0].sensors.len(), 1);
        assert_eq!(devices[0].sensors["juniper.gnmi"].len(), 1);
    }

    #[test]
    fn synthesis_skips_hostless_device() {
        let templates = vec![DeviceTemplate::default()];
        let devices = synthesize_devices(&templates, &HashMap::new());
        assert!(devices.is_empty());
    }
}
