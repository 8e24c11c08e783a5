//! Juniper JTI (OpenConfig Telemetry) driver.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use metrics::counter;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use panoptes_config::Sensor;
use panoptes_core::{DataStore, ExtDataStore, ExtDsSender, Value};
use panoptes_proto::jti::{
    key_value, open_config_telemetry_client::OpenConfigTelemetryClient, OpenConfigData, Path,
    SubscriptionRequest,
};

use crate::labels::extract_labels;
use crate::{Nmi, NmiConn, TelemetryError};

const JTI_VERSION: &str = "1.0";
const DATA_CHAN_SIZE: usize = 100;

/// Factory registered under `juniper.jti`.
pub fn new(conn: NmiConn, sensors: Vec<Sensor>, out: ExtDsSender) -> Box<dyn Nmi> {
    Box::new(Jti::new(conn, sensors, out))
}

pub struct Jti {
    conn: NmiConn,
    paths: Vec<Path>,
    pipeline: Arc<Pipeline>,
}

impl Jti {
    pub fn new(conn: NmiConn, sensors: Vec<Sensor>, out: ExtDsSender) -> Self {
        let mut paths = Vec::with_capacity(sensors.len());
        let mut path_output = HashMap::with_capacity(sensors.len());

        for sensor in &sensors {
            paths.push(Path {
                path: sensor.path.clone(),
                sample_frequency: (sensor.sample_interval * 1000) as u32,
            });

            let path = if sensor.path.ends_with('/') {
                sensor.path.clone()
            } else {
                format!("{}/", sensor.path)
            };
            path_output.insert(path, sensor.output.clone());
        }

        let pipeline = Arc::new(Pipeline { path_output, out });

        Self {
            conn,
            paths,
            pipeline,
        }
    }
}

#[async_trait]
impl Nmi for Jti {
    async fn start(&mut self, shutdown: CancellationToken) -> Result<(), TelemetryError> {
        let mut client = OpenConfigTelemetryClient::new(self.conn.channel.clone());

        let response = client
            .telemetry_subscribe(SubscriptionRequest {
                path_list: self.paths.clone(),
            })
            .await?;
        let mut inbound = response.into_inner();

        let (data_tx, data_rx) = mpsc::channel(DATA_CHAN_SIZE);
        spawn_worker(self.pipeline.clone(), data_rx, shutdown.clone());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                message = inbound.message() => match message {
                    Ok(Some(frame)) => {
                        counter!("juniper_jti_grpc_data_total", "host" => self.conn.target.clone())
                            .increment(1);
                        if data_tx.send(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        return Err(TelemetryError::Stream("stream closed by peer".into()));
                    }
                    Err(status) => {
                        if shutdown.is_cancelled() {
                            return Ok(());
                        }
                        return Err(status.into());
                    }
                },
            }
        }
    }
}

fn spawn_worker(
    pipeline: Arc<Pipeline>,
    mut data_rx: mpsc::Receiver<OpenConfigData>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                frame = data_rx.recv() => match frame {
                    Some(frame) => pipeline.handle_frame(frame),
                    None => return,
                },
            }
        }
    });
}

struct Pipeline {
    path_output: HashMap<String, String>,
    out: ExtDsSender,
}

impl Pipeline {
    fn handle_frame(&self, frame: OpenConfigData) {
        let system_id = frame.system_id.clone();
        let ds = self.raw_datastore(&frame);

        let Some(output) = self.output_for(&frame.path) else {
            self.inc_errors(&system_id);
            error!(system_id = %system_id, path = %frame.path, "output lookup failed");
            return;
        };

        if output.ends_with("::raw") {
            self.emit(
                ExtDataStore {
                    ds,
                    output: output.clone(),
                },
                &system_id,
            );
        } else {
            self.split(ds, &output, &system_id);
        }
    }

    fn raw_datastore(&self, frame: &OpenConfigData) -> DataStore {
        let mut ds = DataStore::new();
        ds.insert(
            "__service__".to_owned(),
            Value::String(format!("jti_v{JTI_VERSION}")),
        );
        ds.insert(
            "__update_timestamp__".to_owned(),
            Value::Uint(frame.timestamp),
        );
        ds.insert("__system_id__".to_owned(), Value::String(frame.system_id.clone()));

        for kv in &frame.kv {
            let Some(value) = kv.value.as_ref().map(decode_value) else {
                continue;
            };
            ds.insert(kv.key.clone(), value);
        }

        ds
    }

    /// Looks up the output for a frame path, stripping the
    /// `sensor_NNNN:<path>:` decoration Junos adds when present.
    fn output_for(&self, path: &str) -> Option<String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r":(/.*/):").expect("static regex"));

        let exact = if path.ends_with('/') {
            path.to_owned()
        } else {
            format!("{path}/")
        };
        if let Some(output) = self.path_output.get(&exact) {
            return Some(output.clone());
        }

        let stripped = re.captures(path)?.get(1)?.as_str();
        self.path_output.get(stripped).cloned()
    }

    fn split(&self, ds: DataStore, output: &str, system_id: &str) {
        let raw_prefix = ds
            .get("__prefix__")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (labels, prefix) = extract_labels(raw_prefix);

        // Junos stamps frames in milliseconds.
        let timestamp = ds
            .get("__update_timestamp__")
            .and_then(Value::as_u64)
            .unwrap_or_default()
            * 1_000_000;

        for (key, value) in &ds {
            if key.starts_with("__") {
                continue;
            }

            let mut split = DataStore::new();
            split.insert("prefix".to_owned(), Value::String(prefix.clone()));
            split.insert("labels".to_owned(), Value::labels(labels.clone()));
            split.insert("timestamp".to_owned(), Value::Uint(timestamp));
            split.insert("system_id".to_owned(), Value::String(system_id.to_owned()));
            split.insert("key".to_owned(), Value::String(key.clone()));
            split.insert("value".to_owned(), value.clone());

            self.emit(
                ExtDataStore {
                    ds: split,
                    output: output.to_owned(),
                },
                system_id,
            );
        }
    }

    fn emit(&self, record: ExtDataStore, system_id: &str) {
        if self.out.try_send(record).is_err() {
            counter!("juniper_jti_drops_total", "host" => system_id.to_owned()).increment(1);
            warn!(system_id = %system_id, "dataset drop");
        }
    }

    fn inc_errors(&self, system_id: &str) {
        counter!("juniper_jti_errors_total", "host" => system_id.to_owned()).increment(1);
    }
}

fn decode_value(value: &key_value::Value) -> Value {
    match value {
        key_value::Value::DoubleValue(v) => Value::Float(*v),
        key_value::Value::IntValue(v) | key_value::Value::SintValue(v) => Value::Int(*v),
        key_value::Value::UintValue(v) => Value::Uint(*v),
        key_value::Value::BytesValue(v) => Value::Bytes(v.clone()),
        key_value::Value::StrValue(v) => Value::String(v.clone()),
        key_value::Value::BoolValue(v) => Value::Bool(*v),
    }
}
