//! Record fan-out.
//!
//! The [`Demux`] consumes the shared record channel and forwards each
//! record to the sink named in its output routing string. Sinks run their
//! own writer loops on per-instance bounded channels; a full sink channel
//! drops the record and counts it against that sink.

pub mod database;
pub mod error;
pub mod producer;
mod settings;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use panoptes_config::{ConfigProvider, Database as DatabaseConfig, Producer as ProducerConfig};
use panoptes_core::{ExtDataStore, ExtDsReceiver, ExtDsSender};

pub use database::{Database, DatabaseFactory, DatabaseRegistrar};
pub use error::DemuxError;
pub use producer::{Producer, ProducerFactory, ProducerRegistrar};

enum SinkConfig {
    Producer(ProducerConfig),
    Database(DatabaseConfig),
}

impl SinkConfig {
    fn changed(&self, other: &SinkConfig) -> bool {
        match (self, other) {
            (SinkConfig::Producer(a), SinkConfig::Producer(b)) => {
                a.service != b.service || a.config != b.config
            }
            (SinkConfig::Database(a), SinkConfig::Database(b)) => {
                a.service != b.service || a.config != b.config
            }
            _ => true,
        }
    }
}

struct SinkEntry {
    config: SinkConfig,
    token: CancellationToken,
}

/// Routes records from the shared channel to per-sink writer loops.
pub struct Demux {
    cfg: Arc<dyn ConfigProvider>,
    producer_registrar: Arc<ProducerRegistrar>,
    database_registrar: Arc<DatabaseRegistrar>,
    root: CancellationToken,

    in_rx: Mutex<Option<ExtDsReceiver>>,
    chan_map: Arc<RwLock<HashMap<String, ExtDsSender>>>,
    registered: Mutex<HashMap<String, SinkEntry>>,
}

impl Demux {
    pub fn new(
        cfg: Arc<dyn ConfigProvider>,
        producer_registrar: Arc<ProducerRegistrar>,
        database_registrar: Arc<DatabaseRegistrar>,
        in_rx: ExtDsReceiver,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            producer_registrar,
            database_registrar,
            root,
            in_rx: Mutex::new(Some(in_rx)),
            chan_map: Arc::new(RwLock::new(HashMap::new())),
            registered: Mutex::new(HashMap::new()),
        })
    }

    /// Starts every configured sink. Runs before the supervisor so records
    /// have somewhere to go.
    pub fn init(&self) {
        for producer in self.cfg.producers() {
            self.register_producer(producer);
        }
        for database in self.cfg.databases() {
            self.register_database(database);
        }
    }

    /// Spawns the main routing loop.
    pub fn start(&self) {
        let mut rx = self
            .in_rx
            .lock()
            .expect("input lock poisoned")
            .take()
            .expect("demux already started");
        let chan_map = Arc::clone(&self.chan_map);
        let root = self.root.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = root.cancelled() => return,
                    record = rx.recv() => match record {
                        Some(record) => route(&chan_map, record),
                        None => return,
                    },
                }
            }
        });
    }

    /// Diffs the configured sinks against the running set.
    pub fn update(&self) {
        let producers: HashMap<String, ProducerConfig> = self
            .cfg
            .producers()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let databases: HashMap<String, DatabaseConfig> = self
            .cfg
            .databases()
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let stale: Vec<String> = {
            let registered = self.registered.lock().expect("registered lock poisoned");
            registered
                .iter()
                .filter(|(name, entry)| {
                    let desired = match &entry.config {
                        SinkConfig::Producer(_) => {
                            producers.get(*name).map(|p| SinkConfig::Producer(p.clone()))
                        }
                        SinkConfig::Database(_) => {
                            databases.get(*name).map(|d| SinkConfig::Database(d.clone()))
                        }
                    };
                    desired.map_or(true, |d| entry.config.changed(&d))
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        // Changed sinks restart below; removed ones just stop.
        for name in stale {
            self.unregister(&name);
        }

        for (name, producer) in producers {
            if !self.is_registered(&name) {
                self.register_producer(producer);
            }
        }
        for (name, database) in databases {
            if !self.is_registered(&name) {
                self.register_database(database);
            }
        }
    }

    fn register_producer(&self, config: ProducerConfig) {
        let Some(factory) = self.producer_registrar.get(&config.service) else {
            error!(name = %config.name, service = %config.service, "producer service not registered");
            return;
        };

        info!(name = %config.name, service = %config.service, "producer starting");

        let token = self.root.child_token();
        let rx = self.open_channel(&config.name);
        let sink = factory(config.clone(), rx, token.clone());
        tokio::spawn(async move { sink.start().await });

        self.registered.lock().expect("registered lock poisoned").insert(
            config.name.clone(),
            SinkEntry {
                config: SinkConfig::Producer(config),
                token,
            },
        );
    }

    fn register_database(&self, config: DatabaseConfig) {
        let Some(factory) = self.database_registrar.get(&config.service) else {
            error!(name = %config.name, service = %config.service, "database service not registered");
            return;
        };

        info!(name = %config.name, service = %config.service, "database starting");

        let token = self.root.child_token();
        let rx = self.open_channel(&config.name);
        let sink = factory(config.clone(), rx, token.clone());
        tokio::spawn(async move { sink.start().await });

        self.registered.lock().expect("registered lock poisoned").insert(
            config.name.clone(),
            SinkEntry {
                config: SinkConfig::Database(config),
                token,
            },
        );
    }

    fn open_channel(&self, name: &str) -> ExtDsReceiver {
        let size = self.cfg.global().buffer_size.max(1);
        let (tx, rx) = tokio::sync::mpsc::channel(size);
        self.chan_map
            .write()
            .expect("chan map lock poisoned")
            .insert(name.to_owned(), tx);
        rx
    }

    fn unregister(&self, name: &str) {
        // Dropping the sender closes the sink's input channel.
        self.chan_map
            .write()
            .expect("chan map lock poisoned")
            .remove(name);

        if let Some(entry) = self
            .registered
            .lock()
            .expect("registered lock poisoned")
            .remove(name)
        {
            info!(name = %name, "sink terminate");
            entry.token.cancel();
        }
    }

    fn is_registered(&self, name: &str) -> bool {
        self.registered
            .lock()
            .expect("registered lock poisoned")
            .contains_key(name)
    }

    /// Number of running sinks.
    pub fn len(&self) -> usize {
        self.registered.lock().expect("registered lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn route(chan_map: &RwLock<HashMap<String, ExtDsSender>>, record: ExtDataStore) {
    let Some((sink, _stream)) = record.route() else {
        counter!("demux_errors_total").increment(1);
        warn!(output = %record.output, "invalid output routing");
        return;
    };

    let sender = chan_map
        .read()
        .expect("chan map lock poisoned")
        .get(sink)
        .cloned();

    match sender {
        Some(tx) => {
            let sink = sink.to_owned();
            if tx.try_send(record).is_err() {
                counter!("demux_drops_total", "sink" => sink).increment(1);
            }
        }
        None => {
            counter!("demux_errors_total").increment(1);
            warn!(sink = %sink, "output sink not registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use panoptes_config::mock::MockConfig;
    use panoptes_core::DataStore;

    struct ForwardingSink {
        rx: ExtDsReceiver,
        token: CancellationToken,
        tx: mpsc::Sender<ExtDataStore>,
    }

    #[async_trait]
    impl Producer for ForwardingSink {
        async fn start(mut self: Box<Self>) {
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    record = self.rx.recv() => match record {
                        Some(record) => { let _ = self.tx.send(record).await; }
                        None => return,
                    },
                }
            }
        }
    }

    static FORWARD_TX: std::sync::OnceLock<mpsc::Sender<ExtDataStore>> =
        std::sync::OnceLock::new();

    fn forwarding_factory(
        _config: ProducerConfig,
        rx: ExtDsReceiver,
        token: CancellationToken,
    ) -> Box<dyn Producer> {
        Box::new(ForwardingSink {
            rx,
            token,
            tx: FORWARD_TX.get().expect("forward channel").clone(),
        })
    }

    fn record(output: &str) -> ExtDataStore {
        ExtDataStore {
            ds: DataStore::new(),
            output: output.to_owned(),
        }
    }

    #[tokio::test]
    async fn routes_records_to_the_named_sink() {
        let (sink_tx, mut sink_rx) = mpsc::channel(10);
        let _ = FORWARD_TX.set(sink_tx);

        let cfg = MockConfig::new();
        cfg.set_producers(vec![ProducerConfig {
            name: "sink1".to_owned(),
            service: "test".to_owned(),
            config: serde_json::Value::Null,
        }]);

        let producer_registrar = Arc::new(ProducerRegistrar::new());
        producer_registrar.register("test", "test", forwarding_factory);
        let database_registrar = Arc::new(DatabaseRegistrar::new());

        let (in_tx, in_rx) = mpsc::channel(10);
        let demux = Demux::new(
            cfg,
            producer_registrar,
            database_registrar,
            in_rx,
            CancellationToken::new(),
        );

        demux.init();
        demux.start();
        assert_eq!(demux.len(), 1);

        in_tx.send(record("sink1::stream1")).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.output, "sink1::stream1");

        // Unknown sink name: dropped, no panic.
        in_tx.send(record("nowhere::stream")).await.unwrap();
        // Malformed output: dropped.
        in_tx.send(record("no-separator")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_restarts_changed_and_stops_removed_sinks() {
        let (sink_tx, _sink_rx) = mpsc::channel(10);
        let _ = FORWARD_TX.set(sink_tx);

        let cfg = MockConfig::new();
        cfg.set_producers(vec![
            ProducerConfig {
                name: "sink1".to_owned(),
                service: "test".to_owned(),
                config: serde_json::Value::Null,
            },
            ProducerConfig {
                name: "sink2".to_owned(),
                service: "test".to_owned(),
                config: serde_json::Value::Null,
            },
        ]);

        let producer_registrar = Arc::new(ProducerRegistrar::new());
        producer_registrar.register("test", "test", forwarding_factory);

        let (_in_tx, in_rx) = mpsc::channel(10);
        let demux = Demux::new(
            cfg.clone(),
            producer_registrar,
            Arc::new(DatabaseRegistrar::new()),
            in_rx,
            CancellationToken::new(),
        );
        demux.init();
        assert_eq!(demux.len(), 2);

        // sink2 removed, sink1 reconfigured.
        cfg.set_producers(vec![ProducerConfig {
            name: "sink1".to_owned(),
            service: "test".to_owned(),
            config: serde_json::json!({"topic": "changed"}),
        }]);
        demux.update();

        assert_eq!(demux.len(), 1);
        let registered = demux.registered.lock().unwrap();
        match &registered["sink1"].config {
            SinkConfig::Producer(p) => {
                assert_eq!(p.config, serde_json::json!({"topic": "changed"}));
            }
            SinkConfig::Database(_) => panic!("expected producer"),
        }
    }
}
