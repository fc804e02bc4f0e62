//! MQTT publishing service
//!
//! Publishes the same documents the REST surface serves: a retained probe
//! per device, periodic Current snapshots, and Sample batches driven by a
//! sequence cursor. Connection failures back off and reconnect like any
//! other source.

use std::sync::Arc;
use std::time::Duration;

use mqtt_async_client::client::{Client, Publish, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::MqttConfig;

use crate::agent::Agent;
use crate::error::ServiceError;
use crate::formatter::Formatter;
use crate::Result;

/// MQTT document publisher
pub struct MqttService {
    agent: Arc<Agent>,
    formatter: Arc<dyn Formatter>,
    config: MqttConfig,
    shutdown: CancellationToken,
}

impl MqttService {
    pub fn new(agent: Arc<Agent>, formatter: Arc<dyn Formatter>, config: MqttConfig) -> Arc<Self> {
        Arc::new(Self {
            agent,
            formatter,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn qos(&self) -> QoS {
        match self.config.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    fn build_client(&self) -> Result<Client> {
        let mut builder = Client::builder();
        builder
            .set_url_string(&format!("mqtt://{}:{}", self.config.host, self.config.port))
            .map_err(|err| ServiceError::Mqtt(err.to_string()))?;
        if let Some(client_id) = &self.config.client_id {
            builder.set_client_id(Some(client_id.clone()));
        }
        builder
            .build()
            .map_err(|err| ServiceError::Mqtt(err.to_string()))
    }

    async fn publish(
        &self,
        client: &mut Client,
        topic: String,
        payload: String,
        retain: bool,
    ) -> Result<()> {
        let mut message = Publish::new(topic, payload.into_bytes());
        message.set_qos(self.qos());
        message.set_retain(retain);
        client
            .publish(&message)
            .await
            .map_err(|err| ServiceError::Mqtt(err.to_string()))
    }

    /// Retained probe documents, one per device
    async fn publish_probe(&self, client: &mut Client) -> Result<()> {
        for device in self.agent.registry().devices() {
            let doc = self
                .formatter
                .format_probe(&self.agent.document_meta(), std::slice::from_ref(device));
            let topic = format!("{}/{}", self.config.probe_topic, device.uuid);
            self.publish(client, topic, doc, true).await?;
        }
        Ok(())
    }

    async fn publish_current(&self, client: &mut Client) -> Result<()> {
        for device in self.agent.registry().devices() {
            let filter = self
                .agent
                .filter_for(Some(device.name.as_str()), None)
                .unwrap_or_default();
            let snapshot = self.agent.buffer().current(Some(&filter), None)?;
            let doc = self
                .formatter
                .format_streams(&self.agent.document_meta(), &snapshot);
            let topic = format!("{}/{}", self.config.current_topic, device.uuid);
            self.publish(client, topic, doc, false).await?;
        }
        Ok(())
    }

    /// Sample batches since the cursor; returns the next cursor
    async fn publish_sample(&self, client: &mut Client, from: u64) -> Result<u64> {
        let result = match self.agent.buffer().sample(
            None,
            Some(from),
            None,
            self.config.sample_count,
        ) {
            Ok(result) => result,
            Err(_) => {
                // Fell behind the buffer; restart from the oldest retained
                let first = self.agent.buffer().first_sequence();
                warn!(from, first, "mqtt sample cursor out of range, realigning");
                return Ok(first);
            }
        };
        if !result.observations.is_empty() {
            let mut meta = self.agent.document_meta();
            meta.next_sequence = result.end_sequence;
            let doc = self.formatter.format_streams(&meta, &result.observations);
            for device in self.agent.registry().devices() {
                let topic = format!("{}/{}", self.config.sample_topic, device.uuid);
                self.publish(client, topic, doc.clone(), false).await?;
            }
        }
        Ok(result.end_sequence)
    }

    /// Newly changed assets since the last turn
    async fn publish_assets(&self, client: &mut Client, seen: &mut u64) -> Result<()> {
        let assets = self.agent.assets().query(None, None, true, usize::MAX);
        for asset in assets {
            let stamp = asset.timestamp.timestamp_micros() as u64;
            if stamp > *seen {
                let doc = self
                    .formatter
                    .format_assets(&self.agent.document_meta(), std::slice::from_ref(&asset));
                let topic = format!("{}/{}", self.config.asset_topic, asset.asset_id);
                self.publish(client, topic, doc, true).await?;
                *seen = stamp;
            }
        }
        Ok(())
    }

    /// One connected session; returns on error or shutdown.
    async fn session(&self, client: &mut Client) -> Result<()> {
        self.publish_probe(client).await?;

        let mut current_timer =
            tokio::time::interval(Duration::from_millis(self.config.current_interval_ms));
        let mut sample_timer =
            tokio::time::interval(Duration::from_millis(self.config.sample_interval_ms));
        let mut cursor = self.agent.buffer().next_sequence();
        let mut assets_seen = 0u64;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = current_timer.tick() => {
                    self.publish_current(client).await?;
                }
                _ = sample_timer.tick() => {
                    cursor = self.publish_sample(client, cursor).await?;
                    self.publish_assets(client, &mut assets_seen).await?;
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(host = %self.config.host, port = self.config.port, "mqtt publisher starting");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.build_client() {
                Ok(mut client) => match client.connect().await {
                    Ok(()) => {
                        info!("mqtt connected");
                        if let Err(err) = self.session(&mut client).await {
                            warn!(error = %err, "mqtt session ended");
                        }
                        let _ = client.disconnect().await;
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "mqtt connect failed");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "mqtt client construction failed");
                }
            }

            debug!(
                interval_ms = self.config.connect_interval_ms,
                "mqtt reconnect backoff"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(self.config.connect_interval_ms)) => {}
            }
        }
        info!("mqtt publisher stopped");
    }
}
