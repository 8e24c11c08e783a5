//! Driver factory tables.

use panoptes_core::Registrar;

use crate::{DialoutFactory, NmiFactory};

/// Name-to-factory tables for dial-in drivers and dial-out collectors,
/// populated once at boot.
#[derive(Default)]
pub struct TelemetryRegistrar {
    drivers: Registrar<NmiFactory>,
    dialout: Registrar<DialoutFactory>,
}

impl TelemetryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, vendor: &str, factory: NmiFactory) {
        self.drivers.register(name, vendor, factory);
    }

    pub fn register_dialout(&self, name: &str, vendor: &str, factory: DialoutFactory) {
        self.dialout.register(name, vendor, factory);
    }

    pub fn get(&self, name: &str) -> Option<NmiFactory> {
        self.drivers.get(name)
    }

    pub fn get_dialout(&self, name: &str) -> Option<DialoutFactory> {
        self.dialout.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains(name)
    }
}
