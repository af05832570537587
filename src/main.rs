//! WE-515 Power Meter CLI
//!
//! A command-line interface (CLI) application for interacting with WE-515
//! single-phase energy meters using Modbus TCP (via a gateway) or Modbus RTU.
//!
//! This tool allows users to:
//! - Read all telemetry values (frequency, voltage, current, power, energy).
//! - Read the device clock and compare it with local time.
//! - Correct the device clock when it drifted.
//! - Program the two-rate tariff schedule.
//! - Run in a continuous daemon mode that polls the meter and publishes every
//!   reading as JSON to an MQTT broker.
//!
//! The CLI leverages the `we515_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use log::*;
use std::process::ExitCode;
use std::time::Duration;
use tokio_modbus::client::sync::Context as ModbusContext;
use we515_lib::{
    client::WE515,
    clock::{self, ClockSync},
    poller::{PollConfig, PollLoop, ShutdownToken},
    protocol as proto, tokio_sync,
};

mod commandline;
mod logging;
mod mqtt;

macro_rules! print_telemetry {
    ($device:expr) => {
        let record = $device
            .read_telemetry()
            .with_context(|| "Cannot read telemetry")?;
        for (field, (name, value)) in proto::TELEMETRY_FIELDS.iter().zip(record.iter()) {
            println!("{name:>22}: {value:>12.3} {}", field.unit);
        }
    };
}

macro_rules! print_clock {
    ($device:expr) => {
        let device_time = $device
            .read_clock()
            .with_context(|| "Cannot read device clock")?;
        let local_time = clock::local_now();
        println!("Device time: {device_time}");
        println!("Local time:  {}", local_time.format("%Y-%m-%d %H:%M:%S"));
        println!(
            "Drift: {:.3}s",
            (local_time - device_time).num_milliseconds() as f64 / 1000.0
        );
    };
}

/// Creates a new WE515 client based on the provided command-line arguments.
fn create_client(
    connection: &commandline::CliConnection,
    timeout: Duration,
) -> Result<WE515<ModbusContext>> {
    let ctx = match connection {
        commandline::CliConnection::Tcp { address, unit, .. } => {
            info!("Attempting to connect via TCP to {address} (Unit: {unit})...");
            tokio_sync::connect_tcp(address, *unit, timeout).with_context(|| {
                format!("Failed to connect to Modbus TCP device at {address}")
            })?
        }
        commandline::CliConnection::Rtu {
            device,
            baud_rate,
            unit,
            ..
        } => {
            info!(
                "Attempting to connect via RTU to device {device} (Unit: {unit}, Baud: {baud_rate})..."
            );
            tokio_sync::connect_rtu(device, *baud_rate, *unit, timeout).with_context(|| {
                format!("Cannot open serial port {device} at baud {baud_rate}")
            })?
        }
    };
    Ok(WE515::new(ctx))
}

/// Handles the sync-clock command.
fn handle_sync_clock(
    client: &mut WE515<ModbusContext>,
    threshold: Duration,
    force: bool,
) -> Result<()> {
    if force {
        let now = clock::local_now();
        info!("Executing: Set Device Clock to {now}");
        client
            .set_clock(&now)
            .with_context(|| "Failed to write device clock")?;
        print_clock!(client);
        return Ok(());
    }

    info!("Executing: Sync Device Clock (threshold {threshold:?})");
    match client
        .sync_clock(threshold)
        .with_context(|| "Failed to sync device clock")?
    {
        ClockSync::InSync { device_time, drift } => {
            println!("Device clock {device_time} is in sync (drift {drift:?}).");
        }
        ClockSync::Corrected {
            previous,
            drift,
            device_time,
        } => {
            println!("Device clock corrected from {previous} to {device_time} (drift was {drift:?}).");
        }
    }
    Ok(())
}

/// Handles the set-tariff-schedule command.
fn handle_set_tariff_schedule(
    client: &mut WE515<ModbusContext>,
    schedule: &proto::TariffSchedule,
) -> Result<()> {
    info!("Executing: Set Tariff Schedule {schedule}");
    println!(
        "WARNING: This will replace the complete tariff schedule of the meter:\n\
         - Rate 1 from {}\n\
         - Rate 2 from {}\n\
         - All other schedule slots are cleared",
        schedule.rate1_start, schedule.rate2_start
    );
    if !Confirm::new()
        .with_prompt("Are you sure you want to proceed?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")?
    {
        info!("Set tariff schedule aborted by user.");
        return Ok(());
    }
    client
        .set_tariff_schedule(schedule)
        .with_context(|| format!("Failed to set tariff schedule {schedule}"))?;
    println!("Tariff schedule set successfully.");
    Ok(())
}

/// Runs the poll-publish loop until a termination signal or the first fault.
fn run_daemon(
    client: WE515<ModbusContext>,
    config: PollConfig,
    config_file: &str,
) -> Result<ExitCode> {
    let mqtt_config = mqtt::MqttConfig::load(config_file)?;
    trace!("MQTT config: {mqtt_config:?}");
    let publisher = mqtt::MqttPublisher::new(mqtt_config)?;

    let shutdown = ShutdownToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        token.cancel();
        trace!("Received termination signal")
    })
    .with_context(|| "Error setting termination signal handler")?;

    info!(
        "Starting daemon mode: interval={:?}, clock sync={}",
        config.interval, config.sync_clock
    );
    let outcome = PollLoop::new(client.into_inner(), publisher, config, shutdown).run();
    info!(
        "Daemon stopped after {} cycles with exit code {}",
        outcome.cycles(),
        outcome.exit_code()
    );
    Ok(ExitCode::from(outcome.exit_code()))
}

fn main() -> Result<ExitCode> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging::init(args.verbose.log_level_filter())?;
    info!(
        "WE-515 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Connect to the meter
    let mut client = create_client(&args.connection, args.timeout)?;
    client.set_exec_delay(args.delay);

    // 3. Execute the command
    match args.connection.command() {
        commandline::CliCommands::Daemon {
            poll_interval,
            drift_threshold,
            skip_clock_sync,
            config_file,
        } => {
            let config = PollConfig {
                interval: *poll_interval,
                drift_threshold: *drift_threshold,
                sync_clock: !*skip_clock_sync,
            };
            return run_daemon(client, config, config_file);
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read Telemetry");
            print_telemetry!(&mut client);
        }
        commandline::CliCommands::ReadClock => {
            info!("Executing: Read Device Clock");
            print_clock!(&mut client);
        }
        commandline::CliCommands::SyncClock { threshold, force } => {
            handle_sync_clock(&mut client, *threshold, *force)?;
        }
        commandline::CliCommands::SetTariffSchedule {
            rate1_start,
            rate2_start,
        } => {
            let schedule = proto::TariffSchedule {
                rate1_start: *rate1_start,
                rate2_start: *rate2_start,
            };
            handle_set_tariff_schedule(&mut client, &schedule)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
