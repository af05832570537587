//! A library for reading the WE-515 single-phase energy meter via Modbus and
//! moving its telemetry into a time-series database.
//!
//! The crate covers both ends of the pipeline:
//!
//! 1.  **Producer**: [`client::WE515`] reads telemetry and manages the device
//!     clock and tariff schedule; [`poller::PollLoop`] samples the meter
//!     periodically and hands JSON payloads to a [`poller::Publisher`].
//!
//! 2.  **Consumer**: [`ingest`] turns received messages into points for the
//!     time-series store.
//!
//! ## Features
//!
//! - **Protocol Implementation**: Register table, value scaling, device clock and tariff schedule encoding.
//! - **Pluggable Register Bus**: All device logic runs against the [`bus::RegisterBus`] trait.
//! - **Graceful Shutdown**: The poll loop stops between cycles and drains the transport before closing the wire.
//!
//! ## Quick Start
//!
//! ```no_run
//! use we515_lib::{client::WE515, tokio_common, tokio_sync};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = tokio_sync::connect_tcp(
//!         "192.168.1.11:8899",
//!         tokio_common::FACTORY_DEFAULT_UNIT,
//!         Duration::from_secs(1),
//!     )?;
//!     let mut meter = WE515::new(ctx);
//!
//!     let record = meter.read_telemetry()?;
//!     println!("Current values: {record}");
//!
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod client;
pub mod clock;
pub mod ingest;
pub mod poller;
pub mod protocol;
pub mod sampler;
pub mod tokio_common;

#[cfg_attr(
    docsrs,
    doc(cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync")))
)]
#[cfg(any(feature = "tokio-rtu-sync", feature = "tokio-tcp-sync"))]
pub mod tokio_sync;
