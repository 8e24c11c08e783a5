//! Time-series database sinks.

pub mod influxdb;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use panoptes_config::Database as DatabaseConfig;
use panoptes_core::{ExtDsReceiver, Registrar};

/// A database writer loop. Consumes its input channel until it is closed
/// or the token is cancelled.
#[async_trait]
pub trait Database: Send {
    async fn start(self: Box<Self>);
}

/// Builds a database sink bound to its input channel.
pub type DatabaseFactory =
    fn(DatabaseConfig, ExtDsReceiver, CancellationToken) -> Box<dyn Database>;

pub type DatabaseRegistrar = Registrar<DatabaseFactory>;

/// Registers the built-in database sinks. Called once at boot.
pub fn register(registrar: &DatabaseRegistrar) {
    registrar.register("influxdb", "influxdata", influxdb::new);
}
