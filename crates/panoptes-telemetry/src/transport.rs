//! Device connection establishment.

use std::time::Duration;

use tonic::transport::Endpoint;

use panoptes_config::DeviceConfig;

use crate::{NmiConn, TelemetryError};

/// Opens a gRPC channel to a device.
///
/// Dialing is lazy: the TCP/TLS handshake happens on the first stream call,
/// so transient device outages surface through the driver and are retried
/// at the next supervisor update. Invalid endpoint or TLS settings fail
/// here and mark the device absent for this cycle.
pub async fn connect(device: &DeviceConfig) -> Result<NmiConn, TelemetryError> {
    let target = format!("{}:{}", device.host, device.port);

    let tls = match &device.tls_config {
        Some(cfg) if cfg.enabled => Some(panoptes_secrets::tls_config(cfg).await?),
        _ => None,
    };

    let scheme = if tls.is_some() { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{target}"))?
        .user_agent("Panoptes")?;

    if device.timeout > 0 {
        endpoint = endpoint.connect_timeout(Duration::from_secs(device.timeout));
    }

    if let Some(tls) = tls {
        endpoint = endpoint.tls_config(tls)?;
    }

    Ok(NmiConn {
        channel: endpoint.connect_lazy(),
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_dial_succeeds_without_a_listener() {
        let device = DeviceConfig {
            host: "core1.lax".to_owned(),
            port: 50051,
            ..Default::default()
        };

        let conn = connect(&device).await.unwrap();
        assert_eq!(conn.target, "core1.lax:50051");
        assert_eq!(conn.system_id(), "core1.lax");
    }

    #[tokio::test]
    async fn invalid_host_fails_establishment() {
        let device = DeviceConfig {
            host: "bad host".to_owned(),
            port: 50051,
            ..Default::default()
        };

        assert!(connect(&device).await.is_err());
    }
}
