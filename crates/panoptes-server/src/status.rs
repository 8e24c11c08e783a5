//! Status endpoint: Prometheus metrics and liveness.

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use panoptes_config::StatusConfig;

/// Installs the Prometheus recorder and serves `/metrics` and `/healthz`
/// in a background task. Returns `None` when the endpoint is disabled.
pub fn start(config: &StatusConfig, shutdown: CancellationToken) -> Option<PrometheusHandle> {
    if config.disabled {
        return None;
    }

    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "prometheus recorder");
            return None;
        }
    };

    let addr = config.addr.clone();
    let render = handle.clone();

    tokio::spawn(async move {
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let render = render.clone();
                    async move { render.render() }
                }),
            )
            .route("/healthz", get(|| async { "ok" }));

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(addr = %addr, error = %err, "status listener");
                return;
            }
        };

        info!(addr = %addr, "status endpoint listening");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        if let Err(err) = served {
            error!(error = %err, "status endpoint");
        }
    });

    Some(handle)
}
