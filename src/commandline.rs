use crate::mqtt::MqttConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::time::Duration;
use we515_lib::{protocol as proto, tokio_common};

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_unit(s: &str) -> Result<u8, String> {
    let unit = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))?;
    if unit == 0 || unit > 247 {
        return Err(format!("Unit id {unit} is outside of 1..=247"));
    }
    Ok(unit)
}

fn parse_tariff_time(s: &str) -> Result<proto::TariffTime, String> {
    s.parse::<proto::TariffTime>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to the meter via a Modbus TCP gateway.
    Tcp {
        /// Host name or IP address and port of the Modbus TCP gateway.
        /// Example: "192.168.1.11:8899".
        #[arg(verbatim_doc_comment)]
        address: String,

        /// The Modbus unit id of the meter (1 to 247, decimal or hex).
        #[arg(short, long, default_value_t = tokio_common::FACTORY_DEFAULT_UNIT, value_parser = parse_unit)]
        unit: u8,

        /// Commands for the connected meter.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect to the meter via Modbus RTU (Serial).
    Rtu {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
        #[arg(short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
        device: String,

        /// Baud rate for serial communication.
        #[arg(long, default_value_t = tokio_common::FACTORY_DEFAULT_BAUD_RATE)]
        baud_rate: u32,

        /// The Modbus unit id of the meter (1 to 247, decimal or hex).
        #[arg(short, long, default_value_t = tokio_common::FACTORY_DEFAULT_UNIT, value_parser = parse_unit)]
        unit: u8,

        /// Commands for the connected meter.
        #[command(subcommand)]
        command: CliCommands,
    },
}

impl CliConnection {
    pub fn command(&self) -> &CliCommands {
        match self {
            CliConnection::Tcp { command, .. } | CliConnection::Rtu { command, .. } => command,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: sync the device clock, then continuously poll the
    /// meter and publish every reading to an MQTT broker.
    /// Stops cleanly on SIGINT/SIGTERM after the running cycle.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between two readings (e.g., "1s", "1m").
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "1s")]
        poll_interval: Duration,

        /// Device clock drift that triggers a rewrite of the device clock.
        #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
        drift_threshold: Duration,

        /// Do not compare and correct the device clock at start-up.
        #[arg(long)]
        skip_clock_sync: bool,

        /// The configuration file for the MQTT broker.
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },

    /// Read and display all telemetry values once.
    Read,

    /// Read and display the device clock and its drift from local time.
    ReadClock,

    /// Rewrite the device clock from local time if it drifted too far.
    SyncClock {
        /// Drift that triggers the rewrite.
        #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
        threshold: Duration,

        /// Write the device clock regardless of the drift.
        #[arg(long)]
        force: bool,
    },

    /// Program the two-rate tariff schedule.
    /// Rate 1 applies from RATE1_START, rate 2 from RATE2_START (both "HH:MM").
    /// All further schedule slots are cleared.
    #[clap(verbatim_doc_comment)]
    SetTariffSchedule {
        #[arg(value_parser = parse_tariff_time)]
        rate1_start: proto::TariffTime,
        #[arg(value_parser = parse_tariff_time)]
        rate2_start: proto::TariffTime,
    },
}

const fn about_text() -> &'static str {
    "WE-515 power meter CLI - Read the meter via Modbus RTU/TCP and publish its telemetry to MQTT."
}

#[derive(Parser, Debug)]
#[command(name="powermeter", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and meter commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// Modbus I/O timeout for every read/write request.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Minimum delay between consecutive Modbus requests of one-shot operations.
    /// Examples: "50ms", "100ms".
    #[arg(global = true, long, default_value = "50ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn unit_parsing() {
        assert_eq!(parse_unit("1"), Ok(1));
        assert_eq!(parse_unit("0x10"), Ok(16));
        assert!(parse_unit("0").is_err());
        assert!(parse_unit("248").is_err());
    }

    #[test]
    fn daemon_defaults() {
        let args =
            CliArgs::try_parse_from(["powermeter", "tcp", "192.168.1.11:8899", "daemon"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(1));
        match args.connection {
            CliConnection::Tcp { address, unit, command } => {
                assert_eq!(address, "192.168.1.11:8899");
                assert_eq!(unit, 1);
                assert_eq!(
                    command,
                    CliCommands::Daemon {
                        poll_interval: Duration::from_secs(1),
                        drift_threshold: we515_lib::clock::DEFAULT_DRIFT_THRESHOLD,
                        skip_clock_sync: false,
                        config_file: MqttConfig::DEFAULT_CONFIG_FILE.to_string(),
                    }
                );
            }
            other => panic!("unexpected connection {other:?}"),
        }
    }

    #[test]
    fn tariff_schedule_arguments() {
        let args = CliArgs::try_parse_from([
            "powermeter",
            "rtu",
            "--unit",
            "2",
            "set-tariff-schedule",
            "08:00",
            "19:30",
        ])
        .unwrap();
        assert_eq!(
            args.connection.command(),
            &CliCommands::SetTariffSchedule {
                rate1_start: proto::TariffTime::try_from((8, 0)).unwrap(),
                rate2_start: proto::TariffTime::try_from((19, 30)).unwrap(),
            }
        );
        assert!(CliArgs::try_parse_from([
            "powermeter",
            "rtu",
            "set-tariff-schedule",
            "24:00",
            "19:30"
        ])
        .is_err());
    }
}
