//! Juniper gNMI driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use prost::Message;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use panoptes_config::Sensor;
use panoptes_core::{DataStore, ExtDataStore, ExtDsSender, Value};
use panoptes_proto::gnmi::{
    gnmi_client::GnmiClient, subscribe_request, subscribe_response, Encoding, Notification, Path,
    PathElem, SubscribeRequest, SubscribeResponse, Subscription, SubscriptionList,
    SubscriptionListMode, SubscriptionMode, TypedValue,
};
use panoptes_proto::juniper::{GnmiJuniperTelemetryHeader, JUNIPER_HEADER_TYPE};

use crate::labels::extract_labels;
use crate::{Nmi, NmiConn, TelemetryError};

const GNMI_VERSION: &str = "0.7.0";
const DATA_CHAN_SIZE: usize = 100;

/// Factory registered under `juniper.gnmi`.
pub fn new(conn: NmiConn, sensors: Vec<Sensor>, out: ExtDsSender) -> Box<dyn Nmi> {
    Box::new(Gnmi::new(conn, sensors, out))
}

pub struct Gnmi {
    conn: NmiConn,
    subscriptions: Vec<Subscription>,
    pipeline: Arc<Pipeline>,
}

impl Gnmi {
    pub fn new(conn: NmiConn, sensors: Vec<Sensor>, out: ExtDsSender) -> Self {
        let mut subscriptions = Vec::with_capacity(sensors.len());
        let mut path_output = HashMap::with_capacity(sensors.len());

        for sensor in &sensors {
            let mode = match sensor.mode.as_str() {
                "on_change" => SubscriptionMode::OnChange,
                "sample" => SubscriptionMode::Sample,
                _ => SubscriptionMode::TargetDefined,
            };

            subscriptions.push(Subscription {
                path: Some(string_to_path(&sensor.path)),
                mode: mode as i32,
                sample_interval: Duration::from_secs(sensor.sample_interval).as_nanos() as u64,
                heartbeat_interval: Duration::from_secs(sensor.heartbeat_interval).as_nanos()
                    as u64,
                suppress_redundant: sensor.suppress_redundant,
            });

            let path = if sensor.path.ends_with('/') {
                sensor.path.clone()
            } else {
                format!("{}/", sensor.path)
            };
            path_output.insert(path, sensor.output.clone());
        }

        let pipeline = Arc::new(Pipeline {
            conn: conn.clone(),
            path_output,
            out,
        });

        Self {
            conn,
            subscriptions,
            pipeline,
        }
    }

    fn subscribe_request(&self) -> SubscribeRequest {
        SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
                prefix: None,
                subscription: self.subscriptions.clone(),
                mode: SubscriptionListMode::Stream as i32,
                encoding: Encoding::Proto as i32,
                updates_only: false,
            })),
        }
    }
}

#[async_trait]
impl Nmi for Gnmi {
    async fn start(&mut self, shutdown: CancellationToken) -> Result<(), TelemetryError> {
        let mut client = GnmiClient::new(self.conn.channel.clone());

        // The request channel stays open for the lifetime of the stream.
        let (req_tx, req_rx) = mpsc::channel(1);
        req_tx
            .send(self.subscribe_request())
            .await
            .map_err(|_| TelemetryError::Stream("request channel closed".into()))?;

        let response = client.subscribe(ReceiverStream::new(req_rx)).await?;
        let mut inbound = response.into_inner();

        let (data_tx, data_rx) = mpsc::channel(DATA_CHAN_SIZE);
        spawn_worker(self.pipeline.clone(), data_rx, shutdown.clone());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                message = inbound.message() => match message {
                    Ok(Some(resp)) => {
                        counter!("juniper_gnmi_grpc_data_total", "host" => self.conn.target.clone())
                            .increment(1);
                        if data_tx.send(resp).await.is_err() {
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
    mut data_rx: mpsc::Receiver<SubscribeResponse>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                resp = data_rx.recv() => match resp {
                    Some(resp) => pipeline.handle_response(resp),
                    None => return,
                },
            }
        }
    });
}

/// Frame-to-record transform shared by the receive loop's workers.
struct Pipeline {
    conn: NmiConn,
    path_output: HashMap<String, String>,
    out: ExtDsSender,
}

impl Pipeline {
    fn handle_response(&self, resp: SubscribeResponse) {
        let Some(subscribe_response::Response::Update(notification)) = resp.response else {
            return;
        };

        let ds = self.raw_datastore(&notification);

        let Some(path) = sensor_path(&ds) else {
            self.inc_errors();
            warn!(host = %self.conn.target, "path not found");
            return;
        };

        let Some(output) = self.path_output.get(&path) else {
            self.inc_errors();
            error!(host = %self.conn.target, path = %path, "output lookup failed");
            return;
        };

        if output.ends_with("::raw") {
            self.emit(ExtDataStore {
                ds,
                output: output.clone(),
            });
        } else {
            self.split(ds, output);
        }
    }

    fn raw_datastore(&self, notification: &Notification) -> DataStore {
        let mut ds = DataStore::new();
        ds.insert(
            "__service__".to_owned(),
            Value::String(format!("gnmi_v{GNMI_VERSION}")),
        );
        ds.insert(
            "__update_timestamp__".to_owned(),
            Value::Int(notification.timestamp),
        );
        ds.insert(
            "__prefix__".to_owned(),
            Value::String(path_to_string(notification.prefix.as_ref())),
        );

        for update in &notification.update {
            let key = relative_path(update.path.as_ref());
            let Some(val) = &update.val else { continue };

            match decode_value(val) {
                Ok(value) => {
                    ds.insert(key, value);
                }
                Err(err) => {
                    self.inc_errors();
                    error!(host = %self.conn.target, error = %err, "value decode");
                }
            }
        }

        ds
    }

    fn split(&self, ds: DataStore, output: &str) {
        let raw_prefix = ds
            .get("__prefix__")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (labels, prefix) = extract_labels(raw_prefix);
        let timestamp = ds
            .get("__update_timestamp__")
            .cloned()
            .unwrap_or(Value::Int(0));
        let system_id = self.conn.system_id().to_owned();

        for (key, value) in &ds {
            if key.starts_with("__") {
                continue;
            }

            let mut split = DataStore::new();
            split.insert("prefix".to_owned(), Value::String(prefix.clone()));
            split.insert("labels".to_owned(), Value::labels(labels.clone()));
            split.insert("timestamp".to_owned(), timestamp.clone());
            split.insert("system_id".to_owned(), Value::String(system_id.clone()));
            split.insert("key".to_owned(), Value::String(key.clone()));
            split.insert("value".to_owned(), value.clone());

            self.emit(ExtDataStore {
                ds: split,
                output: output.to_owned(),
            });
        }
    }

    fn emit(&self, record: ExtDataStore) {
        if self.out.try_send(record).is_err() {
            counter!("juniper_gnmi_drops_total", "host" => self.conn.target.clone()).increment(1);
            warn!(host = %self.conn.target, "dataset drop");
        }
    }

    fn inc_errors(&self) {
        counter!("juniper_gnmi_errors_total", "host" => self.conn.target.clone()).increment(1);
    }
}

/// Resolves the sensor path a frame belongs to: the Juniper header's
/// embedded path when present, the notification prefix otherwise.
fn sensor_path(ds: &DataStore) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r":(/.*/):").expect("static regex"));

    if let Some(header) = ds.get("__juniper_telemetry_header__").and_then(Value::as_map) {
        let path = header.get("path").and_then(Value::as_str)?;
        return re
            .captures(path)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned());
    }

    let prefix = ds.get("__prefix__").and_then(Value::as_str)?;
    if prefix.is_empty() || prefix == "/" {
        return None;
    }

    Some(if prefix.ends_with('/') {
        prefix.to_owned()
    } else {
        format!("{prefix}/")
    })
}

/// Decodes a gNMI typed value into the internal variant.
pub(crate) fn decode_value(tv: &TypedValue) -> Result<Value, TelemetryError> {
    use panoptes_proto::gnmi::typed_value::Value as Tv;

    let Some(value) = &tv.value else {
        return Err(TelemetryError::Decode("empty typed value".into()));
    };

    Ok(match value {
        Tv::StringVal(v) | Tv::AsciiVal(v) => Value::String(v.clone()),
        Tv::IntVal(v) => Value::Int(*v),
        Tv::UintVal(v) => Value::Uint(*v),
        Tv::BoolVal(v) => Value::Bool(*v),
        Tv::BytesVal(v) => Value::Bytes(v.clone()),
        Tv::FloatVal(v) => Value::Float(f64::from(*v)),
        Tv::DecimalVal(v) => Value::Float(v.digits as f64 / 10f64.powi(v.precision as i32)),
        Tv::LeaflistVal(list) => Value::List(
            list.element
                .iter()
                .map(decode_value)
                .collect::<Result<_, _>>()
                .map_err(|e| TelemetryError::Decode(format!("leaflist: {e}")))?,
        ),
        Tv::JsonVal(raw) | Tv::JsonIetfVal(raw) => {
            let json: serde_json::Value = serde_json::from_slice(raw)
                .map_err(|e| TelemetryError::Decode(e.to_string()))?;
            Value::from(json)
        }
        Tv::AnyVal(any) => decode_any(any)?,
    })
}

fn decode_any(any: &prost_types::Any) -> Result<Value, TelemetryError> {
    if !any.type_url.ends_with(JUNIPER_HEADER_TYPE) {
        return Err(TelemetryError::Decode(format!(
            "unknown any message: {}",
            any.type_url
        )));
    }

    let header = GnmiJuniperTelemetryHeader::decode(any.value.as_slice())
        .map_err(|e| TelemetryError::Decode(e.to_string()))?;

    let mut map = std::collections::BTreeMap::new();
    map.insert("system_id".to_owned(), Value::String(header.system_id));
    map.insert(
        "component_id".to_owned(),
        Value::Uint(u64::from(header.component_id)),
    );
    map.insert(
        "sub_component_id".to_owned(),
        Value::Uint(u64::from(header.sub_component_id)),
    );
    map.insert("path".to_owned(), Value::String(header.path));
    map.insert(
        "sequence_number".to_owned(),
        Value::Uint(header.sequence_number),
    );

    Ok(Value::Map(map))
}

/// Parses a schema path string into gNMI path elements, keeping bracketed
/// key predicates with their element.
pub(crate) fn string_to_path(path: &str) -> Path {
    let mut elems = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for ch in path.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            '/' if depth == 0 => {
                if !current.is_empty() {
                    elems.push(parse_elem(&current));
                    current.clear();
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        elems.push(parse_elem(&current));
    }

    Path {
        origin: String::new(),
        elem: elems,
        target: String::new(),
    }
}

fn parse_elem(raw: &str) -> PathElem {
    let name_end = raw.find('[').unwrap_or(raw.len());
    let mut elem = PathElem {
        name: raw[..name_end].to_owned(),
        key: HashMap::new(),
    };

    let mut rest = &raw[name_end..];
    while let Some(close) = rest.find(']') {
        let predicate = &rest[1..close];
        if let Some((key, value)) = predicate.split_once('=') {
            elem.key
                .insert(key.to_owned(), value.trim_matches('\'').to_owned());
        }
        rest = &rest[close + 1..];
    }

    elem
}

/// Renders a prefix path back to its string form, predicates included and
/// a trailing slash appended.
pub(crate) fn path_to_string(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };

    let mut out = String::new();
    for elem in &path.elem {
        out.push('/');
        out.push_str(&elem.name);

        let mut keys: Vec<_> = elem.key.iter().collect();
        keys.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in keys {
            out.push_str(&format!("[{key}='{value}']"));
        }
    }
    out.push('/');

    out
}

fn relative_path(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };

    path.elem
        .iter()
        .map(|e| e.name.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use panoptes_proto::gnmi::typed_value::Value as Tv;
    use panoptes_proto::gnmi::{Decimal64, ScalarArray, Update};
    use tonic::transport::Endpoint;

    fn test_conn() -> NmiConn {
        NmiConn {
            channel: Endpoint::from_static("http://core1.lax:50051").connect_lazy(),
            target: "core1.lax:50051".to_owned(),
        }
    }

    fn test_sensor(output: &str) -> Sensor {
        Sensor {
            service: "juniper.gnmi".to_owned(),
            path: "/interfaces/interface[name='lo0']/state/counters".to_owned(),
            mode: "sample".to_owned(),
            sample_interval: 10,
            output: output.to_owned(),
            ..Default::default()
        }
    }

    fn typed(value: Tv) -> Option<TypedValue> {
        Some(TypedValue { value: Some(value) })
    }

    fn update(key: &str, value: Tv) -> Update {
        Update {
            path: Some(string_to_path(key)),
            val: typed(value),
            duplicates: 0,
        }
    }

    fn notification(metrics: Vec<Update>) -> SubscribeResponse {
        SubscribeResponse {
            response: Some(subscribe_response::Response::Update(Notification {
                timestamp: 1_596_067_993_610_000_000,
                prefix: Some(string_to_path(
                    "/interfaces/interface[name='lo0']/state/counters",
                )),
                update: metrics,
            })),
        }
    }

    #[test]
    fn decimal_decodes_by_precision() {
        let val = TypedValue {
            value: Some(Tv::DecimalVal(Decimal64 {
                digits: 12345,
                precision: 2,
            })),
        };
        assert_eq!(decode_value(&val).unwrap(), Value::Float(123.45));
    }

    #[test]
    fn leaflist_decodes_elementwise() {
        let val = TypedValue {
            value: Some(Tv::LeaflistVal(ScalarArray {
                element: vec![
                    TypedValue {
                        value: Some(Tv::StringVal("a".into())),
                    },
                    TypedValue {
                        value: Some(Tv::UintVal(2)),
                    },
                ],
            })),
        };
        assert_eq!(
            decode_value(&val).unwrap(),
            Value::List(vec![Value::String("a".into()), Value::Uint(2)])
        );
    }

    #[test]
    fn json_ietf_decodes_to_dynamic_value() {
        let val = TypedValue {
            value: Some(Tv::JsonIetfVal(br#"{"in-octets": 100}"#.to_vec())),
        };
        let decoded = decode_value(&val).unwrap();
        assert_eq!(decoded.as_map().unwrap()["in-octets"], Value::Uint(100));
    }

    #[test]
    fn juniper_header_roundtrips_through_path_extraction() {
        let header = GnmiJuniperTelemetryHeader {
            system_id: "core1.lax".to_owned(),
            component_id: 1,
            sub_component_id: 0,
            path: "sensor_1000:/interfaces/interface/state/counters/:mib2d".to_owned(),
            sequence_number: 1,
        };
        let any = prost_types::Any {
            type_url: format!("type.googleapis.com/{JUNIPER_HEADER_TYPE}"),
            value: header.encode_to_vec(),
        };

        let decoded = decode_value(&TypedValue {
            value: Some(Tv::AnyVal(any)),
        })
        .unwrap();

        let mut ds = DataStore::new();
        ds.insert("__juniper_telemetry_header__".to_owned(), decoded);
        assert_eq!(
            sensor_path(&ds).unwrap(),
            "/interfaces/interface/state/counters/"
        );
    }

    #[test]
    fn path_string_roundtrip_keeps_predicates() {
        let path = string_to_path("/interfaces/interface[name='lo0']/state/counters/");
        assert_eq!(path.elem.len(), 4);
        assert_eq!(path.elem[1].key["name"], "lo0");
        assert_eq!(
            path_to_string(Some(&path)),
            "/interfaces/interface[name='lo0']/state/counters/"
        );
    }

    #[tokio::test]
    async fn split_emits_one_record_per_metric() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let gnmi = Gnmi::new(test_conn(), vec![test_sensor("console::stdout")], tx);

        gnmi.pipeline.handle_response(notification(vec![
            update("in-octets", Tv::UintVal(1000)),
            update("out-octets", Tv::UintVal(2000)),
        ]));

        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        assert_eq!(records.len(), 2);

        for record in &records {
            assert_eq!(record.output, "console::stdout");
            assert_eq!(
                record.ds["prefix"],
                Value::String("/interfaces/interface/state/counters/".into())
            );
            assert_eq!(
                record.ds["labels"],
                Value::labels([("name".to_owned(), "lo0".to_owned())])
            );
            assert_eq!(record.ds["timestamp"], Value::Int(1_596_067_993_610_000_000));
            assert_eq!(record.ds["system_id"], Value::String("core1.lax".into()));
        }

        let keys: Vec<_> = records
            .iter()
            .map(|r| r.ds["key"].as_str().unwrap().to_owned())
            .collect();
        assert!(keys.contains(&"in-octets".to_owned()));
        assert!(keys.contains(&"out-octets".to_owned()));
    }

    #[tokio::test]
    async fn raw_output_emits_a_single_record() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let mut sensor = test_sensor("kafka1::ifcounters::raw");
        sensor.path = "/interfaces/interface[name='lo0']/state/counters/".to_owned();
        let gnmi = Gnmi::new(test_conn(), vec![sensor], tx);

        gnmi.pipeline.handle_response(notification(vec![
            update("in-octets", Tv::UintVal(1000)),
            update("out-octets", Tv::UintVal(2000)),
        ]));

        let record = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(record.output, "kafka1::ifcounters::raw");
        assert_eq!(record.ds["__service__"], Value::String("gnmi_v0.7.0".into()));
        assert_eq!(record.ds["in-octets"], Value::Uint(1000));
        assert_eq!(record.ds["out-octets"], Value::Uint(2000));
    }

    #[tokio::test]
    async fn missing_output_drops_the_frame() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let mut sensor = test_sensor("console::stdout");
        sensor.path = "/some/other/path/".to_owned();
        let gnmi = Gnmi::new(test_conn(), vec![sensor], tx);

        gnmi.pipeline
            .handle_response(notification(vec![update("in-octets", Tv::UintVal(1))]));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let gnmi = Gnmi::new(test_conn(), vec![test_sensor("console::stdout")], tx);

        gnmi.pipeline.handle_response(notification(vec![
            update("in-octets", Tv::UintVal(1)),
            update("out-octets", Tv::UintVal(2)),
            update("in-errors", Tv::UintVal(3)),
        ]));

        // Capacity one: exactly one record made it, the rest were dropped.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
