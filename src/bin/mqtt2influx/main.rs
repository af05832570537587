//! MQTT to InfluxDB bridge
//!
//! Subscribes to the telemetry topics of the broker and stores every
//! well-formed message as one InfluxDB point: the topic
//! `/<namespace>/<location>/<measurement>` names the measurement and the
//! `location` tag, the JSON payload supplies the fields and the time.
//! Malformed messages are logged and dropped.

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use futures::{stream::StreamExt, Stream};
use log::*;
use paho_mqtt as mqtt;
use std::time::Duration;
use we515_lib::ingest;

mod config;
mod influx;
#[path = "../../logging.rs"]
mod logging;

use config::Config;
use influx::Store;

const STREAM_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "mqtt2influx", author, version, about = "Store WE-515 telemetry received via MQTT in InfluxDB.", long_about = None)]
struct CliArgs {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// The YAML configuration file for broker and database.
    #[arg(long, default_value_t = Config::DEFAULT_CONFIG_FILE.to_string())]
    config_file: String,
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Feeds received messages into the store until the stream ends.
async fn forward<S>(mut messages: S, store: &Store)
where
    S: Stream<Item = Option<mqtt::Message>> + Unpin,
{
    while let Some(msg_opt) = messages.next().await {
        let Some(msg) = msg_opt else {
            // paho reconnects on its own and re-subscribes in the connected callback
            warn!("Lost connection to the broker, waiting for reconnect");
            continue;
        };
        trace!("Received on {}: {}", msg.topic(), msg.payload_str());
        if let Some(point) = ingest::accept(msg.topic(), msg.payload()) {
            if let Err(err) = store.write(&point).await {
                error!("Cannot store point from {}: {err}", msg.topic());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let _log_handle = logging::init(args.verbose.log_level_filter())?;
    let config = Config::load(&args.config_file)?;
    trace!("Config: {config:?}");

    info!("Connecting to InfluxDB at {}", config.influxdb.url);
    let store = Store::new(&config.influxdb);
    store
        .ensure_database()
        .await
        .with_context(|| format!("Cannot prepare database {}", config.influxdb.database))?;

    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(&config.mqtt.uri)
        .client_id(&config.mqtt.client_id)
        .finalize();
    let mut client =
        mqtt::AsyncClient::new(create_opts).with_context(|| "Error creating mqtt client")?;

    // Get message stream before connecting.
    let messages = client.get_stream(STREAM_CAPACITY);

    let topic = config.mqtt.topic.clone();
    let qos = config.mqtt.qos;
    client.set_connected_callback(move |client| {
        info!("Connected to mqtt broker {}, subscribing to {topic}", client.server_uri());
        client.subscribe(&topic, qos);
    });
    client.set_connection_lost_callback(|client| {
        warn!("Connection to {} lost", client.server_uri());
    });

    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    let mut conn_builder = conn_builder
        .keep_alive_interval(config.mqtt.keep_alive)
        .clean_session(true)
        .automatic_reconnect(Duration::from_secs(1), Duration::from_secs(30));
    if let Some(user_name) = &config.mqtt.username {
        conn_builder = conn_builder.user_name(user_name)
    }
    if let Some(password) = &config.mqtt.password {
        conn_builder = conn_builder.password(password)
    }
    let conn_opts = conn_builder.finalize();

    info!("Connecting to mqtt broker {}", config.mqtt.uri);
    client
        .connect(conn_opts)
        .await
        .with_context(|| "Mqtt client unable to connect")?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = forward(messages, &store) => {
            warn!("Message stream ended unexpectedly");
        }
    }

    info!("Stopping...");
    client
        .disconnect(None)
        .await
        .with_context(|| "Error disconnect mqtt client")?;
    Ok(())
}
