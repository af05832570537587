//! MQTT transport of the `powermeter` daemon.

use anyhow::{Context, Result};
use log::*;
use paho_mqtt as mqtt;
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use we515_lib::poller::Publisher;

/// Broker connection settings, loaded from a YAML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URI, e.g. `tcp://localhost:1883`.
    pub uri: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic every reading is published to.
    pub topic: String,
    /// Quality of service code to use
    pub qos: i32,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Upper bound for flushing queued messages on shutdown.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            uri: String::from("tcp://localhost:1883"),
            client_id: format!("powermeter-{:08x}", rand::random::<u32>()),
            username: None,
            password: None,
            topic: String::from("/dommu/common/energy"),
            qos: 1,
            keep_alive: Duration::from_secs(20),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt.yml";

    /// Loads the configuration from `path`.
    ///
    /// A missing file is only accepted for [`Self::DEFAULT_CONFIG_FILE`], in which
    /// case the built-in defaults are used.
    pub fn load(path: &str) -> Result<Self> {
        if path == Self::DEFAULT_CONFIG_FILE && !Path::new(path).exists() {
            info!("No {path} found, using default MQTT settings");
            return Ok(Self::default());
        }
        debug!("Loading MQTT config file from {path:?}");
        let file =
            std::fs::File::open(path).with_context(|| format!("Cannot open config file {path}"))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0..=2).contains(&self.qos) {
            anyhow::bail!("Invalid MQTT qos {}, expected 0, 1 or 2", self.qos);
        }
        Ok(())
    }
}

fn on_connect_success(client: &mqtt::AsyncClient, _msgid: u16) {
    info!("MQTT: connected to {}", client.server_uri());
}

/// The first connect attempt is not covered by automatic reconnect, so retry here.
fn on_connect_failure(client: &mqtt::AsyncClient, _msgid: u16, rc: i32) {
    warn!("MQTT: connection refused: {rc}");
    std::thread::sleep(Duration::from_millis(2500));
    client.reconnect_with_callbacks(on_connect_success, on_connect_failure);
}

/// [`Publisher`] backed by the paho background thread.
///
/// Messages published while the broker is unreachable are buffered by paho
/// and sent once the connection is (re-)established.
pub struct MqttPublisher {
    client: mqtt::AsyncClient,
    config: MqttConfig,
    pending: Vec<mqtt::DeliveryToken>,
}

impl MqttPublisher {
    const MAX_BUFFERED_MESSAGES: i32 = 10_000;

    pub fn new(config: MqttConfig) -> Result<Self> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(&config.uri)
            .client_id(&config.client_id)
            .send_while_disconnected(true)
            .max_buffered_messages(Self::MAX_BUFFERED_MESSAGES)
            .finalize();
        let client =
            mqtt::AsyncClient::new(create_opts).with_context(|| "Error creating mqtt client")?;
        Ok(Self {
            client,
            config,
            pending: Vec::new(),
        })
    }

    /// Forgets completed deliveries, logging the failed ones.
    fn prune_delivered(&mut self) {
        self.pending.retain_mut(|token| match token.try_wait() {
            None => true,
            Some(Ok(_)) => false,
            Some(Err(err)) => {
                warn!("MQTT: delivery failed: {err}");
                false
            }
        });
    }
}

impl Publisher for MqttPublisher {
    type Error = mqtt::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        self.client.set_connection_lost_callback(|client| {
            warn!("MQTT: connection to {} lost, reconnecting", client.server_uri());
        });

        let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
        let mut conn_builder = conn_builder
            .keep_alive_interval(self.config.keep_alive)
            .clean_session(true)
            .automatic_reconnect(Duration::from_secs(1), Duration::from_secs(30));
        if let Some(user_name) = &self.config.username {
            conn_builder = conn_builder.user_name(user_name)
        }
        if let Some(password) = &self.config.password {
            conn_builder = conn_builder.password(password)
        }
        let conn_opts = conn_builder.finalize();

        info!("MQTT: connecting asynchronously to {}", self.config.uri);
        self.client
            .connect_with_callbacks(conn_opts, on_connect_success, on_connect_failure);
        Ok(())
    }

    fn publish(&mut self, payload: String) -> Result<(), Self::Error> {
        self.prune_delivered();
        let msg = mqtt::Message::new(self.config.topic.as_str(), payload, self.config.qos);
        self.pending.push(self.client.publish(msg));
        trace!("MQTT: {} messages in flight", self.pending.len());
        Ok(())
    }

    fn drain(mut self) -> Result<(), Self::Error> {
        self.prune_delivered();
        let deadline = Instant::now() + self.config.drain_timeout;
        let outstanding = self.pending.len();
        let mut undelivered = 0;
        for token in self.pending.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(err) = token.wait_for(remaining) {
                debug!("MQTT: message not delivered: {err}");
                undelivered += 1;
            }
        }
        if undelivered > 0 {
            warn!("MQTT: {undelivered} of {outstanding} queued messages were not delivered");
        }

        if self.client.is_connected() {
            self.client
                .disconnect(None)
                .wait_for(self.config.drain_timeout)?;
            info!("MQTT: disconnected");
        }
        Ok(())
    }
}
