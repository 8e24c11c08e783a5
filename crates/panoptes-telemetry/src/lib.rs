//! Telemetry ingestion: the per-device subscription lifecycle and the
//! streaming protocol drivers.
//!
//! The [`Supervisor`] keeps the set of active device subscriptions equal to
//! the filtered configuration snapshot. Each subscription runs one driver
//! per service named in the device's sensor map; drivers translate provider
//! frames into [`panoptes_core::DataStore`] records and push them onto the
//! shared output channel with non-blocking sends.

pub mod dialout;
pub mod error;
pub mod juniper;
mod labels;
pub mod registrar;
pub mod supervisor;
pub mod transport;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use panoptes_config::Sensor;
use panoptes_core::ExtDsSender;

pub use error::TelemetryError;
pub use registrar::TelemetryRegistrar;
pub use supervisor::{DeviceFilter, Supervisor};

/// A device connection handed to driver factories.
#[derive(Debug, Clone)]
pub struct NmiConn {
    pub channel: Channel,
    /// `host:port` of the device, the host half doubling as `system_id`.
    pub target: String,
}

impl NmiConn {
    /// The host half of the connection target.
    pub fn system_id(&self) -> &str {
        self.target
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.target)
    }
}

/// A streaming protocol driver bound to one device and one service.
///
/// `start` runs until the token is cancelled (clean return) or the
/// underlying stream fails with the token still live (error returned
/// upward; the supervisor decides whether to re-establish).
#[async_trait]
pub trait Nmi: Send {
    async fn start(&mut self, shutdown: CancellationToken) -> Result<(), TelemetryError>;
}

/// Builds a driver for one device connection carrying the given sensors.
pub type NmiFactory = fn(NmiConn, Vec<Sensor>, ExtDsSender) -> Box<dyn Nmi>;

/// Builds a dial-out collector listening on the given address.
pub type DialoutFactory = fn(String, ExtDsSender) -> Box<dyn Nmi>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_id_is_the_host_half() {
        let conn = NmiConn {
            channel: tonic::transport::Endpoint::from_static("http://127.0.0.1:50051")
                .connect_lazy(),
            target: "core1.lax:50051".to_owned(),
        };
        assert_eq!(conn.system_id(), "core1.lax");
    }
}
