//! Per-device subscription lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use panoptes_config::{ConfigProvider, Device};
use panoptes_core::ExtDsSender;

use crate::registrar::TelemetryRegistrar;
use crate::transport;

/// A named predicate over devices; returning `false` rejects the device.
pub type DeviceFilter = Arc<dyn Fn(&Device) -> bool + Send + Sync>;

/// Keeps the set of active device subscriptions equal to the filtered
/// configuration snapshot.
///
/// State per device is the cancellation handle of its driver session,
/// keyed by host. Modified devices are handled as remove-plus-add; an
/// active subscription is never mutated in place.
pub struct Supervisor {
    cfg: Arc<dyn ConfigProvider>,
    registrar: Arc<TelemetryRegistrar>,
    out: ExtDsSender,
    root: CancellationToken,

    devices: Mutex<HashMap<String, Device>>,
    register: Mutex<HashMap<String, CancellationToken>>,
    filters: Mutex<HashMap<String, DeviceFilter>>,

    devices_current: AtomicU64,
    conns_current: AtomicU64,

    // Handed to driver tasks so a failing driver can tear its device down.
    weak: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(
        cfg: Arc<dyn ConfigProvider>,
        registrar: Arc<TelemetryRegistrar>,
        out: ExtDsSender,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cfg,
            registrar,
            out,
            root,
            devices: Mutex::new(HashMap::new()),
            register: Mutex::new(HashMap::new()),
            filters: Mutex::new(HashMap::new()),
            devices_current: AtomicU64::new(0),
            conns_current: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    /// Opens one connection per filtered device and starts its drivers.
    pub async fn start(&self) {
        for device in self.get_devices() {
            self.subscribe(device).await;
        }
    }

    /// Brings the active set in line with the current filtered snapshot.
    pub async fn update(&self) {
        let desired: HashMap<String, Device> = self
            .get_devices()
            .into_iter()
            .map(|d| (d.host().to_owned(), d))
            .collect();

        let current = self.devices.lock().expect("devices lock poisoned").clone();

        for (host, device) in current {
            match desired.get(&host) {
                Some(want) if *want == device => {}
                // Changed or removed; a changed device is re-added below.
                _ => self.unsubscribe(&host),
            }
        }

        for (host, device) in desired {
            let subscribed = self
                .register
                .lock()
                .expect("register lock poisoned")
                .contains_key(&host);
            if !subscribed {
                self.subscribe(device).await;
            }
        }
    }

    /// Starts a device subscription. A no-op when the device is already
    /// present.
    pub async fn subscribe(&self, device: Device) {
        let host = device.host().to_owned();

        if self
            .register
            .lock()
            .expect("register lock poisoned")
            .contains_key(&host)
        {
            return;
        }

        let conn = match transport::connect(&device.config).await {
            Ok(conn) => conn,
            Err(err) => {
                // Absent for this cycle; retried at the next update.
                error!(host = %host, error = %err, "connect failed");
                return;
            }
        };

        info!(host = %host, "connect");
        self.conns_current.fetch_add(1, Ordering::Relaxed);
        gauge!("grpc_conn_current").increment(1.0);

        let token = self.root.child_token();
        self.register
            .lock()
            .expect("register lock poisoned")
            .insert(host.clone(), token.clone());
        self.devices
            .lock()
            .expect("devices lock poisoned")
            .insert(host.clone(), device.clone());
        self.devices_current.fetch_add(1, Ordering::Relaxed);
        gauge!("devices_current").increment(1.0);

        for (service, sensors) in device.sensors.clone() {
            let Some(factory) = self.registrar.get(&service) else {
                warn!(host = %host, service = %service, "service not registered");
                continue;
            };

            let mut driver = factory(conn.clone(), sensors, self.out.clone());
            let task_token = token.clone();
            let supervisor = self.weak.clone();
            let host = host.clone();
            let service = service.clone();

            tokio::spawn(async move {
                if let Err(err) = driver.start(task_token.clone()).await {
                    if !task_token.is_cancelled() {
                        error!(host = %host, service = %service, error = %err, "driver failed");
                        // Tear the whole device down; the next update
                        // re-establishes it if still desired.
                        if let Some(supervisor) = supervisor.upgrade() {
                            supervisor.unsubscribe(&host);
                        }
                    }
                }
            });
        }
    }

    /// Cancels a device's driver session and removes it from the registry.
    pub fn unsubscribe(&self, host: &str) {
        let token = self
            .register
            .lock()
            .expect("register lock poisoned")
            .remove(host);

        if let Some(token) = token {
            token.cancel();
            self.conns_current.fetch_sub(1, Ordering::Relaxed);
            gauge!("grpc_conn_current").decrement(1.0);
        }

        let removed = self
            .devices
            .lock()
            .expect("devices lock poisoned")
            .remove(host);

        if removed.is_some() {
            self.devices_current.fetch_sub(1, Ordering::Relaxed);
            gauge!("devices_current").decrement(1.0);
            info!(host = %host, "terminate");
        }
    }

    /// The configured devices minus any rejected by an installed filter.
    pub fn get_devices(&self) -> Vec<Device> {
        let filters = self.filters.lock().expect("filters lock poisoned");
        self.cfg
            .devices()
            .into_iter()
            .filter(|d| filters.values().all(|keep| keep(d)))
            .collect()
    }

    /// Installs a named device filter.
    pub fn add_filter_opt(&self, name: &str, filter: DeviceFilter) {
        self.filters
            .lock()
            .expect("filters lock poisoned")
            .insert(name.to_owned(), filter);
    }

    /// Removes a named device filter.
    pub fn del_filter_opt(&self, name: &str) {
        self.filters
            .lock()
            .expect("filters lock poisoned")
            .remove(name);
    }

    /// True when the device is currently subscribed.
    pub fn contains(&self, host: &str) -> bool {
        self.devices
            .lock()
            .expect("devices lock poisoned")
            .contains_key(host)
    }

    /// Number of active device subscriptions.
    pub fn devices_current(&self) -> u64 {
        self.devices_current.load(Ordering::Relaxed)
    }

    /// Number of open device connections.
    pub fn conns_current(&self) -> u64 {
        self.conns_current.load(Ordering::Relaxed)
    }
}
