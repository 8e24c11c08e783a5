//! Panoptes collector binary.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use panoptes_demux::{database, producer, DatabaseRegistrar, Demux, ProducerRegistrar};
use panoptes_server::{status, update, Shards};
use panoptes_telemetry::dialout::Dialout;
use panoptes_telemetry::{juniper, Supervisor, TelemetryRegistrar};

#[derive(Debug, Parser)]
#[command(name = "panoptes", about = "Network telemetry ingestion and distribution")]
struct Args {
    /// Configuration source: a YAML file path, `consul://host:port/prefix/`,
    /// or `etcd://host:port/prefix/`.
    #[arg(long, default_value = "panoptes.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("panoptes=info".parse().expect("directive")),
        )
        .init();

    let args = Args::parse();

    let cfg = match panoptes_config::new_provider(&args.config).await {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    info!("starting ...");

    let global = cfg.global();
    let root = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel(global.buffer_size.max(1));
    let (update_tx, update_rx) = mpsc::channel(1);

    // Discovery registration is fatal at startup when configured.
    let discovery = match panoptes_discovery::register(cfg.clone()).await {
        Ok(discovery) => discovery,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    let producer_registrar = Arc::new(ProducerRegistrar::new());
    producer::register(&producer_registrar);

    let database_registrar = Arc::new(DatabaseRegistrar::new());
    database::register(&database_registrar);

    let telemetry_registrar = Arc::new(TelemetryRegistrar::new());
    juniper::register(&telemetry_registrar);

    // The demux comes up before the supervisor so records have somewhere
    // to go; its main loop runs in the background.
    let demux = Demux::new(
        cfg.clone(),
        producer_registrar,
        database_registrar,
        out_rx,
        root.clone(),
    );
    demux.init();
    demux.start();

    let supervisor = Supervisor::new(
        cfg.clone(),
        telemetry_registrar.clone(),
        out_tx.clone(),
        root.clone(),
    );
    if !global.shards.enabled {
        supervisor.start().await;
    }

    let dialout = Dialout::new(cfg.clone(), telemetry_registrar, out_tx, root.clone());
    dialout.start();

    status::start(&global.status, root.clone());

    tokio::spawn(update::update_loop(
        cfg.clone(),
        demux,
        supervisor.clone(),
        dialout,
        update_rx,
        root.clone(),
    ));

    if global.shards.enabled {
        match &discovery {
            Some(discovery) => {
                let shards = Shards::new(
                    cfg.clone(),
                    supervisor.clone(),
                    discovery.clone(),
                    update_tx,
                );
                tokio::spawn(shards.start(root.clone()));
            }
            None => {
                eprintln!("sharding requires a discovery backend");
                return ExitCode::from(1);
            }
        }
    }

    wait_for_shutdown().await;
    info!("shutting down ...");

    if let Some(discovery) = discovery {
        if let Err(err) = discovery.deregister().await {
            error!(error = %err, "deregister");
        }
    }

    root.cancel();
    // Bounded grace period for drivers and sinks to drain.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "signal handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
