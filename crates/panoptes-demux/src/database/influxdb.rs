//! InfluxDB sink writing line protocol over the v2 HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use panoptes_config::Database as DatabaseConfig;
use panoptes_core::{ExtDataStore, ExtDsReceiver, Value};

use super::Database;
use crate::error::DemuxError;
use crate::settings::sink_settings;

pub fn new(
    config: DatabaseConfig,
    rx: ExtDsReceiver,
    token: CancellationToken,
) -> Box<dyn Database> {
    Box::new(InfluxDb { config, rx, token })
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct InfluxConfig {
    server: String,
    bucket: String,
    org: String,
    token: String,
    batch_size: usize,
    flush_interval: u64,
    timeout: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8086".to_owned(),
            bucket: String::new(),
            org: String::new(),
            token: String::new(),
            batch_size: 1000,
            flush_interval: 1,
            timeout: 10,
        }
    }
}

pub struct InfluxDb {
    config: DatabaseConfig,
    rx: ExtDsReceiver,
    token: CancellationToken,
}

#[async_trait]
impl Database for InfluxDb {
    async fn start(mut self: Box<Self>) {
        let settings: InfluxConfig =
            match sink_settings(&self.config.config, "database", &self.config.name) {
                Ok(settings) => settings,
                Err(err) => {
                    error!(name = %self.config.name, error = %err, "influxdb config");
                    return;
                }
            };

        // The token field accepts a remote secret reference.
        let auth = match panoptes_secrets::get_credentials(&settings.token).await {
            Ok(Some(secrets)) => secrets.get("token").cloned().unwrap_or_default(),
            Ok(None) => settings.token.clone(),
            Err(err) => {
                error!(name = %self.config.name, error = %err, "influxdb token");
                return;
            }
        };

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                error!(name = %self.config.name, error = %err, "influxdb client");
                return;
            }
        };

        let url = format!(
            "{}/api/v2/write?org={}&bucket={}",
            settings.server.trim_end_matches('/'),
            settings.org,
            settings.bucket
        );

        info!(
            name = %self.config.name,
            server = %settings.server,
            bucket = %settings.bucket,
            "influxdb started"
        );

        let mut batch: Vec<String> = Vec::with_capacity(settings.batch_size);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(settings.flush_interval.max(1)));

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    flush(&client, &url, &auth, &mut batch).await;
                    info!(name = %self.config.name, "influxdb terminated");
                    return;
                }
                _ = ticker.tick() => flush(&client, &url, &auth, &mut batch).await,
                record = self.rx.recv() => match record {
                    Some(record) => {
                        match line_protocol(&record) {
                            Ok(line) => batch.push(line),
                            Err(err) => {
                                error!(name = %self.config.name, error = %err, output = %record.output, "influxdb encode");
                            }
                        }
                        if batch.len() >= settings.batch_size {
                            flush(&client, &url, &auth, &mut batch).await;
                        }
                    }
                    None => {
                        flush(&client, &url, &auth, &mut batch).await;
                        return;
                    }
                },
            }
        }
    }
}

async fn flush(client: &reqwest::Client, url: &str, auth: &str, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }

    let body = batch.join("\n");
    batch.clear();

    let result = client
        .post(url)
        .header("Authorization", format!("Token {auth}"))
        .body(body)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => error!(status = %response.status(), "influxdb write rejected"),
        Err(err) => error!(error = %err, "influxdb write"),
    }
}

/// Renders one split record as an InfluxDB line: the stream is the
/// measurement, prefix/system_id/labels become tags, the metric key its
/// field.
fn line_protocol(record: &ExtDataStore) -> Result<String, DemuxError> {
    let (_, stream) = record
        .route()
        .ok_or_else(|| DemuxError::InvalidOutput(record.output.clone()))?;
    let measurement = stream.split("::").next().unwrap_or(stream);

    let prefix = record
        .ds
        .get("prefix")
        .and_then(Value::as_str)
        .ok_or_else(|| DemuxError::Write("record has no prefix".into()))?;
    let system_id = record
        .ds
        .get("system_id")
        .and_then(Value::as_str)
        .ok_or_else(|| DemuxError::Write("record has no system_id".into()))?;
    let key = record
        .ds
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| DemuxError::Write("record has no key".into()))?;
    let value = record
        .ds
        .get("value")
        .ok_or_else(|| DemuxError::Write("record has no value".into()))?;
    let timestamp = record
        .ds
        .get("timestamp")
        .ok_or_else(|| DemuxError::Write("record has no timestamp".into()))?;

    let mut line = String::with_capacity(128);
    line.push_str(measurement);
    line.push_str(",_prefix_=");
    line.push_str(&escape_tag(prefix));
    line.push_str(",_host_=");
    line.push_str(&escape_tag(system_id));

    if let Some(labels) = record.ds.get("labels").and_then(Value::as_map) {
        for (name, value) in labels {
            if let Some(value) = value.as_str() {
                line.push(',');
                line.push_str(&escape_tag(name));
                line.push('=');
                line.push_str(&escape_tag(&value.replace(' ', "_")));
            }
        }
    }

    line.push(' ');
    line.push_str(&escape_tag(key));
    line.push('=');
    line.push_str(&field_value(value));
    line.push(' ');
    line.push_str(&field_value(timestamp));

    Ok(line)
}

fn escape_tag(raw: &str) -> String {
    raw.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn field_value(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Float(v) => format!("{v}"),
        Value::Bool(v) => v.to_string(),
        Value::String(v) => format!("\"{}\"", v.replace('"', "\\\"")),
        Value::Bytes(v) => format!("\"{}\"", String::from_utf8_lossy(v)),
        Value::List(_) | Value::Map(_) => {
            let json = serde_json::to_string(value).unwrap_or_default();
            format!("\"{}\"", json.replace('"', "\\\""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panoptes_core::DataStore;

    fn split_record() -> ExtDataStore {
        let mut ds = DataStore::new();
        ds.insert(
            "prefix".to_owned(),
            Value::String("/interfaces/interface/".to_owned()),
        );
        ds.insert(
            "labels".to_owned(),
            Value::labels([("name".to_owned(), "lo0".to_owned())]),
        );
        ds.insert("timestamp".to_owned(), Value::Uint(1_596_067_993_610_000_000));
        ds.insert("system_id".to_owned(), Value::String("core1.lax".to_owned()));
        ds.insert("key".to_owned(), Value::String("in-octets".to_owned()));
        ds.insert("value".to_owned(), Value::Uint(52_613_789));

        ExtDataStore {
            ds,
            output: "tsdb1::ifcounters".to_owned(),
        }
    }

    #[test]
    fn line_protocol_shape() {
        let line = line_protocol(&split_record()).unwrap();
        assert_eq!(
            line,
            "ifcounters,_prefix_=/interfaces/interface/,_host_=core1.lax,name=lo0 \
             in-octets=52613789 1596067993610000000"
        );
    }

    #[test]
    fn tag_escaping() {
        assert_eq!(escape_tag("a b,c=d"), "a\\ b\\,c\\=d");
    }

    #[test]
    fn string_fields_are_quoted() {
        assert_eq!(field_value(&Value::String("up".into())), "\"up\"");
        assert_eq!(field_value(&Value::Bool(true)), "true");
        assert_eq!(field_value(&Value::Float(1.5)), "1.5");
    }

    #[test]
    fn record_without_key_is_rejected() {
        let mut record = split_record();
        record.ds.remove("key");
        assert!(line_protocol(&record).is_err());
    }
}
