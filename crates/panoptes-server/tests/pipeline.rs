//! End-to-end pipeline: a driver's records flow through the shared channel
//! and the demux into a producer sink, and a config reload tears the
//! device's subscription down.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use panoptes_config::mock::MockConfig;
use panoptes_config::{Device, DeviceConfig, Producer as ProducerConfig, Sensor};
use panoptes_core::{DataStore, ExtDataStore, ExtDsReceiver, ExtDsSender, Value};
use panoptes_demux::{DatabaseRegistrar, Demux, Producer, ProducerRegistrar};
use panoptes_telemetry::{Nmi, NmiConn, Supervisor, TelemetryError, TelemetryRegistrar};

static CAPTURED: OnceLock<mpsc::Sender<ExtDataStore>> = OnceLock::new();

/// Emits a handful of split records, then parks until cancelled.
struct EmittingDriver {
    out: ExtDsSender,
}

#[async_trait]
impl Nmi for EmittingDriver {
    async fn start(&mut self, shutdown: CancellationToken) -> Result<(), TelemetryError> {
        for i in 0..3u64 {
            let mut ds = DataStore::new();
            ds.insert("prefix".to_owned(), Value::String("/interfaces/".to_owned()));
            ds.insert("system_id".to_owned(), Value::String("core1.lax".to_owned()));
            ds.insert("key".to_owned(), Value::String(format!("metric-{i}")));
            ds.insert("value".to_owned(), Value::Uint(i));

            let _ = self.out.try_send(ExtDataStore {
                ds,
                output: "sink1::ifcounters".to_owned(),
            });
        }

        shutdown.cancelled().await;
        Ok(())
    }
}

fn emitting_factory(_conn: NmiConn, _sensors: Vec<Sensor>, out: ExtDsSender) -> Box<dyn Nmi> {
    Box::new(EmittingDriver { out })
}

struct CapturingSink {
    rx: ExtDsReceiver,
    token: CancellationToken,
}

#[async_trait]
impl Producer for CapturingSink {
    async fn start(mut self: Box<Self>) {
        let captured = CAPTURED.get().expect("capture channel").clone();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                record = self.rx.recv() => match record {
                    Some(record) => { let _ = captured.send(record).await; }
                    None => return,
                },
            }
        }
    }
}

fn capturing_factory(
    _config: ProducerConfig,
    rx: ExtDsReceiver,
    token: CancellationToken,
) -> Box<dyn Producer> {
    Box::new(CapturingSink { rx, token })
}

fn test_device(host: &str) -> Device {
    Device {
        config: DeviceConfig {
            host: host.to_owned(),
            port: 50051,
            ..Default::default()
        },
        sensors: HashMap::from([(
            "test.driver".to_owned(),
            vec![Sensor {
                service: "test.driver".to_owned(),
                path: "/interfaces/".to_owned(),
                output: "sink1::ifcounters".to_owned(),
                ..Default::default()
            }],
        )]),
    }
}

#[tokio::test]
async fn records_flow_from_driver_to_sink_until_reload_removes_the_device() {
    let (captured_tx, mut captured_rx) = mpsc::channel(100);
    let _ = CAPTURED.set(captured_tx);

    let cfg = MockConfig::new();
    cfg.set_devices(vec![test_device("core1.lax")]);
    cfg.set_producers(vec![ProducerConfig {
        name: "sink1".to_owned(),
        service: "capture".to_owned(),
        config: serde_json::Value::Null,
    }]);

    let root = CancellationToken::new();

    let telemetry_registrar = Arc::new(TelemetryRegistrar::new());
    telemetry_registrar.register("test.driver", "test", emitting_factory);

    let producer_registrar = Arc::new(ProducerRegistrar::new());
    producer_registrar.register("capture", "test", capturing_factory);

    let (out_tx, out_rx) = mpsc::channel(16);
    let demux = Demux::new(
        cfg.clone(),
        producer_registrar,
        Arc::new(DatabaseRegistrar::new()),
        out_rx,
        root.clone(),
    );
    demux.init();
    demux.start();

    let supervisor = Supervisor::new(cfg.clone(), telemetry_registrar, out_tx, root.clone());
    supervisor.start().await;
    assert_eq!(supervisor.devices_current(), 1);

    // All three driver records arrive at the capturing sink.
    for _ in 0..3 {
        let record = tokio::time::timeout(Duration::from_secs(2), captured_rx.recv())
            .await
            .expect("record delivery")
            .expect("channel open");
        assert_eq!(record.output, "sink1::ifcounters");
        assert_eq!(record.ds["system_id"], Value::String("core1.lax".into()));
    }

    // The device disappears from config; the next update unsubscribes it.
    cfg.set_devices(vec![]);
    supervisor.update().await;
    assert_eq!(supervisor.devices_current(), 0);
    assert!(!supervisor.contains("core1.lax"));

    root.cancel();
}
