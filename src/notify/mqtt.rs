//! MQTT delivery.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, QoS};

use crate::config::MqttSettings;
use crate::notify::NotificationChannel;
use crate::validate::ValidatedEvent;

/// Publishes each event to a fixed topic at QoS 1.
///
/// The broker connection is driven by a background thread draining the
/// rumqttc event loop; `send` only enqueues the publish and reports enqueue
/// failures. Broker-side delivery problems show up in the connection thread
/// log.
pub struct MqttChannel {
    client: Client,
    topic: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttChannel {
    pub fn new(settings: &MqttSettings) -> Result<Self> {
        let client_id = format!("cat-sentry-{:04x}", rand::random::<u16>());
        let mut options = MqttOptions::new(client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(60));

        let (client, connection) = Client::new(options, 10);
        let handle = spawn_connection_thread(connection);

        Ok(Self {
            client,
            topic: settings.topic.clone(),
            connection_handle: Some(handle),
        })
    }
}

fn spawn_connection_thread(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        }
    })
}

impl NotificationChannel for MqttChannel {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn send(&mut self, event: &ValidatedEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("serialize event for MQTT")?;
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("MQTT publish to {} failed", self.topic))?;
        Ok(())
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        if self.client.disconnect().is_err() {
            log::debug!("MQTT client already disconnected");
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}
