//! Built-in console producer.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use panoptes_config::Producer as ProducerConfig;
use panoptes_core::ExtDsReceiver;

use super::Producer;

pub fn new(
    _config: ProducerConfig,
    rx: ExtDsReceiver,
    token: CancellationToken,
) -> Box<dyn Producer> {
    Box::new(Console { rx, token })
}

/// Serialises records to stdout.
pub struct Console {
    rx: ExtDsReceiver,
    token: CancellationToken,
}

#[async_trait]
impl Producer for Console {
    async fn start(mut self: Box<Self>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("console producer terminated");
                    return;
                }
                record = self.rx.recv() => match record {
                    Some(record) => match serde_json::to_string(&record.ds) {
                        Ok(line) => println!("{line}"),
                        Err(err) => info!(error = %err, "console serialise"),
                    },
                    None => return,
                },
            }
        }
    }
}
