//! The reload cascade.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use panoptes_config::ConfigProvider;
use panoptes_demux::Demux;
use panoptes_telemetry::dialout::Dialout;
use panoptes_telemetry::Supervisor;

const COALESCE_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the reload cascade.
///
/// Informer tokens defer the next update to the timer tick so bursts of
/// change events coalesce; an explicit request (shard rebalance) triggers
/// immediately. A failed config reload aborts the cascade — downstream
/// components never update on stale data.
pub async fn update_loop(
    cfg: Arc<dyn ConfigProvider>,
    demux: Arc<Demux>,
    supervisor: Arc<Supervisor>,
    dialout: Arc<Dialout>,
    mut update_request: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) {
    let informer = cfg.informer();
    let mut informed = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = informer.notified() => {
                informed = true;
                continue;
            }
            request = update_request.recv() => {
                if request.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(COALESCE_INTERVAL) => {
                if !informed {
                    continue;
                }
                informed = false;
            }
        }

        if let Err(err) = cfg.update().await {
            error!(error = %err, "update");
            continue;
        }

        demux.update();
        supervisor.update().await;
        dialout.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use panoptes_config::mock::MockConfig;
    use panoptes_config::{Device, DeviceConfig, Sensor};
    use panoptes_demux::{DatabaseRegistrar, ProducerRegistrar};
    use panoptes_telemetry::{Nmi, NmiConn, TelemetryError, TelemetryRegistrar};

    use async_trait::async_trait;
    use panoptes_core::ExtDsSender;

    struct IdleDriver;

    #[async_trait]
    impl Nmi for IdleDriver {
        async fn start(&mut self, shutdown: CancellationToken) -> Result<(), TelemetryError> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn idle_factory(_conn: NmiConn, _sensors: Vec<Sensor>, _out: ExtDsSender) -> Box<dyn Nmi> {
        Box::new(IdleDriver)
    }

    fn device(host: &str) -> Device {
        Device {
            config: DeviceConfig {
                host: host.to_owned(),
                port: 50051,
                ..Default::default()
            },
            sensors: HashMap::from([("test.gnmi".to_owned(), Vec::new())]),
        }
    }

    struct Fixture {
        cfg: Arc<MockConfig>,
        supervisor: Arc<Supervisor>,
        update_tx: mpsc::Sender<()>,
        shutdown: CancellationToken,
    }

    fn fixture() -> Fixture {
        let cfg = MockConfig::new();
        let shutdown = CancellationToken::new();

        let registrar = Arc::new(TelemetryRegistrar::new());
        registrar.register("test.gnmi", "test", idle_factory);

        let (out_tx, out_rx) = tokio::sync::mpsc::channel(8);
        let supervisor = Supervisor::new(cfg.clone(), registrar.clone(), out_tx.clone(), shutdown.clone());

        let demux = Demux::new(
            cfg.clone(),
            Arc::new(ProducerRegistrar::new()),
            Arc::new(DatabaseRegistrar::new()),
            out_rx,
            shutdown.clone(),
        );

        let dialout = Dialout::new(cfg.clone(), registrar, out_tx, shutdown.clone());

        let (update_tx, update_rx) = mpsc::channel(1);
        tokio::spawn(update_loop(
            cfg.clone() as Arc<dyn ConfigProvider>,
            demux,
            supervisor.clone(),
            dialout,
            update_rx,
            shutdown.clone(),
        ));

        Fixture {
            cfg,
            supervisor,
            update_tx,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn informer_defers_to_the_coalescing_timer() {
        let f = fixture();
        f.cfg.set_devices(vec![device("core1.lax"), device("core1.lhr")]);
        f.supervisor.start().await;
        assert_eq!(f.supervisor.devices_current(), 2);

        // Remove one device and post several change tokens.
        f.cfg.set_devices(vec![device("core1.lhr")]);
        for _ in 0..3 {
            f.cfg.informer().notify_one();
        }

        // Nothing happens before the timer fires.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.supervisor.devices_current(), 2);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(f.supervisor.devices_current(), 1);
        assert!(!f.supervisor.contains("core1.lax"));

        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_request_triggers_immediately() {
        let f = fixture();
        f.cfg.set_devices(vec![device("core1.lax")]);

        f.update_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.supervisor.devices_current(), 1);
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_config_reload_aborts_the_cascade() {
        let f = fixture();
        f.cfg.set_devices(vec![device("core1.lax")]);
        f.supervisor.start().await;

        f.cfg.fail_updates(true);
        f.cfg.set_devices(vec![]);

        f.update_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The cascade never ran; the supervisor still holds the device.
        assert_eq!(f.supervisor.devices_current(), 1);
        f.shutdown.cancel();
    }
}
