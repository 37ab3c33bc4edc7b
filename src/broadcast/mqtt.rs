use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};

use crate::broadcast::TelemetrySink;

/// Publishes each telemetry payload to an MQTT topic at QoS 0.
///
/// The connection event loop runs on its own thread. A dead loop makes the next
/// `send` fail, which removes the sink from the broadcaster.
pub struct MqttSink {
    client: Client,
    topic: String,
    broker: String,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttSink {
    /// Connect to `broker` given as `host:port`. A random suffix is appended to
    /// `client_prefix` so concurrent daemons do not evict each other.
    pub fn connect(broker: &str, topic: &str, client_prefix: &str) -> Result<Self> {
        let (host, port) = parse_broker(broker)?;
        let client_id = format!("{}-{:08x}", client_prefix, rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, 10);
        let handle = spawn_event_loop(connection);
        log::info!("telemetry: MQTT publishing to {} on {}", topic, broker);

        Ok(Self {
            client,
            topic: topic.to_string(),
            broker: broker.to_string(),
            connection_handle: Some(handle),
        })
    }
}

fn spawn_event_loop(mut connection: Connection) -> std::thread::JoinHandle<()> {
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

fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let (host, port) = broker
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("MQTT broker must be host:port, got {}", broker))?;
    if host.is_empty() {
        return Err(anyhow!("MQTT broker host is empty"));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid MQTT broker port in {}", broker))?;
    Ok((host.to_string(), port))
}

impl TelemetrySink for MqttSink {
    fn describe(&self) -> String {
        format!("mqtt {}/{}", self.broker, self.topic)
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        if self
            .connection_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
        {
            return Err(anyhow!("MQTT event loop stopped"));
        }
        self.client
            .try_publish(self.topic.clone(), QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .context("queue MQTT publish")?;
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        let _ = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}
