//! Sink settings resolution.

use figment::providers::{Env, Serialized};
use figment::Figment;

use crate::error::DemuxError;

/// Materialises a sink's typed settings from its opaque config tree, with
/// `panoptes_<role>_<name>_<field>` environment variables overriding
/// individual fields.
pub(crate) fn sink_settings<T>(
    config: &serde_json::Value,
    role: &str,
    name: &str,
) -> Result<T, DemuxError>
where
    T: serde::de::DeserializeOwned + serde::Serialize + Default,
{
    let base: T = if config.is_null() {
        T::default()
    } else {
        serde_json::from_value(config.clone()).map_err(|e| DemuxError::SinkConfig(e.to_string()))?
    };

    let prefix = format!("PANOPTES_{}_{}_", role.to_uppercase(), name.to_uppercase());

    Figment::from(Serialized::defaults(base))
        .merge(Env::prefixed(&prefix))
        .extract()
        .map_err(|e| DemuxError::SinkConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
    #[serde(default)]
    struct Settings {
        server: String,
        bucket: String,
    }

    #[test]
    fn environment_overrides_config_fields() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PANOPTES_DATABASE_TSDB1_BUCKET", "overridden");

            let config = serde_json::json!({"server": "http://influxdb:8086", "bucket": "ifcounters"});
            let settings: Settings = sink_settings(&config, "database", "tsdb1").unwrap();

            assert_eq!(settings.server, "http://influxdb:8086");
            assert_eq!(settings.bucket, "overridden");
            Ok(())
        });
    }
}
