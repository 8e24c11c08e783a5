//! MQTT producer.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use panoptes_config::Producer as ProducerConfig;
use panoptes_core::ExtDsReceiver;

use super::Producer;
use crate::error::DemuxError;

pub fn new(
    config: ProducerConfig,
    rx: ExtDsReceiver,
    token: CancellationToken,
) -> Box<dyn Producer> {
    Box::new(Mqtt { config, rx, token })
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct MqttConfig {
    broker: String,
    port: u16,
    client_id: String,
    topic_prefix: String,
    keep_alive: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1".to_owned(),
            port: 1883,
            client_id: "panoptes".to_owned(),
            topic_prefix: "panoptes".to_owned(),
            keep_alive: 15,
        }
    }
}

/// Publishes each record as JSON to `<topic_prefix>/<stream>`.
pub struct Mqtt {
    config: ProducerConfig,
    rx: ExtDsReceiver,
    token: CancellationToken,
}

impl Mqtt {
    fn settings(&self) -> Result<MqttConfig, DemuxError> {
        crate::settings::sink_settings(&self.config.config, "producer", &self.config.name)
    }
}

#[async_trait]
impl Producer for Mqtt {
    async fn start(mut self: Box<Self>) {
        let settings = match self.settings() {
            Ok(settings) => settings,
            Err(err) => {
                error!(name = %self.config.name, error = %err, "mqtt config");
                return;
            }
        };

        let mut options =
            MqttOptions::new(settings.client_id, settings.broker.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive));
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        info!(name = %self.config.name, broker = %settings.broker, "mqtt producer started");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!(name = %self.config.name, "mqtt producer terminated");
                    return;
                }
                // The event loop must keep turning for the client to make
                // progress.
                event = eventloop.poll() => {
                    if let Err(err) = event {
                        error!(name = %self.config.name, error = %err, "mqtt connection");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
                record = self.rx.recv() => match record {
                    Some(record) => {
                        let stream = record
                            .route()
                            .map(|(_, stream)| stream.split("::").next().unwrap_or(stream))
                            .unwrap_or("records");
                        let topic = format!("{}/{stream}", settings.topic_prefix);

                        let payload = match serde_json::to_vec(&record.ds) {
                            Ok(payload) => payload,
                            Err(err) => {
                                error!(name = %self.config.name, error = %err, "mqtt serialise");
                                continue;
                            }
                        };

                        if let Err(err) = client
                            .publish(topic, QoS::AtLeastOnce, false, payload)
                            .await
                        {
                            error!(name = %self.config.name, error = %err, "mqtt publish");
                        }
                    }
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_come_from_the_opaque_config_tree() {
        let config = ProducerConfig {
            name: "bus1".to_owned(),
            service: "mqtt".to_owned(),
            config: serde_json::json!({"broker": "mqtt.example.net", "port": 8883}),
        };
        let (_, rx) = tokio::sync::mpsc::channel(1);
        let mqtt = Mqtt {
            config,
            rx,
            token: CancellationToken::new(),
        };

        let settings = mqtt.settings().unwrap();
        assert_eq!(settings.broker, "mqtt.example.net");
        assert_eq!(settings.port, 8883);
        // defaults survive partial configs
        assert_eq!(settings.topic_prefix, "panoptes");
    }
}
