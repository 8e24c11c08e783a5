//! Juniper streaming telemetry drivers.

pub mod gnmi;
pub mod jti;

use crate::registrar::TelemetryRegistrar;

/// Registers the Juniper drivers. Called once at boot.
pub fn register(registrar: &TelemetryRegistrar) {
    registrar.register("juniper.gnmi", "juniper", gnmi::new);
    registrar.register("juniper.jti", "juniper", jti::new);
}
