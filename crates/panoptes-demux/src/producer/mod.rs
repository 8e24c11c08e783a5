//! Message-bus producer sinks.

pub mod console;
pub mod mqtt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use panoptes_config::Producer as ProducerConfig;
use panoptes_core::{ExtDsReceiver, Registrar};

/// A producer writer loop. Consumes its input channel until it is closed
/// or the token is cancelled.
#[async_trait]
pub trait Producer: Send {
    async fn start(self: Box<Self>);
}

/// Builds a producer bound to its input channel.
pub type ProducerFactory =
    fn(ProducerConfig, ExtDsReceiver, CancellationToken) -> Box<dyn Producer>;

pub type ProducerRegistrar = Registrar<ProducerFactory>;

/// Registers the built-in producers. Called once at boot.
pub fn register(registrar: &ProducerRegistrar) {
    registrar.register("console", "builtin", console::new);
    registrar.register("mqtt", "eclipse", mqtt::new);
}
