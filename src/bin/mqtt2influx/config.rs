use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub uri: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Subscription filter, may contain wildcards.
    pub topic: String,
    /// Quality of service code to use
    pub qos: i32,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            uri: String::from("tcp://localhost:1883"),
            client_id: String::from("MQTTInfluxDBBridge"),
            username: None,
            password: None,
            topic: String::from("/dommu/#"),
            qos: 1,
            keep_alive: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://localhost:8086"),
            username: Some(String::from("root")),
            password: Some(String::from("root")),
            database: String::from("home_db"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub influxdb: InfluxConfig,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt2influx.yml";

    /// Loads the configuration from `path`; a missing default file yields the
    /// built-in defaults.
    pub fn load(path: &str) -> Result<Self> {
        if path == Self::DEFAULT_CONFIG_FILE && !Path::new(path).exists() {
            log::info!("No {path} found, using default settings");
            return Ok(Self::default());
        }
        log::debug!("Loading config file from {path:?}");
        let file =
            std::fs::File::open(path).with_context(|| format!("Cannot open config file {path}"))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse config file {path}"))?;
        if !(0..=2).contains(&config.mqtt.qos) {
            anyhow::bail!("Invalid MQTT qos {}, expected 0, 1 or 2", config.mqtt.qos);
        }
        Ok(config)
    }
}
