//! Dial-out collector lifecycle.
//!
//! Dial-out services accept connections initiated by devices instead of
//! dialing out to them. Which collectors run comes from
//! `global.dialout.services`; the concrete server for each service is
//! resolved through the registrar's dial-out factory table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use panoptes_config::ConfigProvider;
use panoptes_core::ExtDsSender;

use crate::registrar::TelemetryRegistrar;

struct Entry {
    addr: String,
    token: CancellationToken,
}

/// Manages one server task per configured dial-out service.
pub struct Dialout {
    cfg: Arc<dyn ConfigProvider>,
    registrar: Arc<TelemetryRegistrar>,
    out: ExtDsSender,
    root: CancellationToken,
    servers: Mutex<HashMap<String, Entry>>,
}

impl Dialout {
    pub fn new(
        cfg: Arc<dyn ConfigProvider>,
        registrar: Arc<TelemetryRegistrar>,
        out: ExtDsSender,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registrar,
            out,
            root,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Starts every configured dial-out service.
    pub fn start(&self) {
        for (service, settings) in self.cfg.global().dialout.services {
            self.spawn(&service, &settings.addr);
        }
    }

    /// Diffs the configured services against the running set: new services
    /// start, removed ones stop, address changes restart.
    pub fn update(&self) {
        let desired = self.cfg.global().dialout.services;

        let stale: Vec<String> = {
            let servers = self.servers.lock().expect("servers lock poisoned");
            servers
                .iter()
                .filter(|(service, entry)| {
                    desired
                        .get(*service)
                        .map_or(true, |settings| settings.addr != entry.addr)
                })
                .map(|(service, _)| service.clone())
                .collect()
        };

        for service in stale {
            self.stop(&service);
        }

        for (service, settings) in desired {
            let running = self
                .servers
                .lock()
                .expect("servers lock poisoned")
                .contains_key(&service);
            if !running {
                self.spawn(&service, &settings.addr);
            }
        }
    }

    fn spawn(&self, service: &str, addr: &str) {
        let Some(factory) = self.registrar.get_dialout(service) else {
            warn!(service = %service, "dialout service not registered");
            return;
        };

        info!(service = %service, addr = %addr, "dialout starting");

        let token = self.root.child_token();
        self.servers.lock().expect("servers lock poisoned").insert(
            service.to_owned(),
            Entry {
                addr: addr.to_owned(),
                token: token.clone(),
            },
        );

        let mut server = factory(addr.to_owned(), self.out.clone());
        let service = service.to_owned();
        tokio::spawn(async move {
            if let Err(err) = server.start(token.clone()).await {
                if !token.is_cancelled() {
                    error!(service = %service, error = %err, "dialout failed");
                }
            }
        });
    }

    fn stop(&self, service: &str) {
        if let Some(entry) = self
            .servers
            .lock()
            .expect("servers lock poisoned")
            .remove(service)
        {
            info!(service = %service, "dialout terminate");
            entry.token.cancel();
        }
    }

    /// Number of running dial-out servers.
    pub fn len(&self) -> usize {
        self.servers.lock().expect("servers lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
