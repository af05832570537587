//! Synchronous `tokio-modbus` transport for the WE-515 meter.
//!
//! Implements [`RegisterBus`] for the blocking
//! [`tokio_modbus::client::sync::Context`] and provides connect helpers that
//! always install a per-request deadline, so a hung meter surfaces as a timeout
//! error instead of blocking the caller forever.
//!
//! # Examples
//!
//! ## TCP Client Example
//!
//! ```no_run
//! use we515_lib::{clock, tokio_sync};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = tokio_sync::connect_tcp("192.168.1.11:8899", 1, Duration::from_secs(1))?;
//!     let device_time = clock::read_device_clock(&mut ctx)?;
//!     println!("Device time: {device_time}");
//!     Ok(())
//! }
//! ```
//!
//! ## RTU Client Example
//!
//! ```no_run
//! use we515_lib::{sampler, tokio_sync};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = tokio_sync::connect_rtu("/dev/ttyUSB0", 9600, 1, Duration::from_secs(1))?;
//!     let record = sampler::sample(&mut ctx)?;
//!     println!("{record}");
//!     Ok(())
//! }
//! ```

use crate::{bus::RegisterBus, tokio_common::Result};
use std::time::Duration;
use tokio_modbus::client::sync::Context;
use tokio_modbus::prelude::{SyncReader, SyncWriter};

/// Helper function to map tokio result to our result.
fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()), // Modbus exception
        Err(err) => Err(err.into()),     // IO error
    }
}

impl RegisterBus for Context {
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        map_tokio_result(SyncReader::read_holding_registers(self, address, quantity))
    }

    /// Uses the multiple-register write function even for a single register,
    /// the meter does not implement "write single register".
    fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        map_tokio_result(SyncWriter::write_multiple_registers(self, address, words))
    }
}

/// Connects to a meter behind a Modbus TCP gateway.
///
/// `address` is `host:port`; host names are resolved and the first address is
/// used. Both connecting and every later request are bounded by `timeout`.
#[cfg(feature = "tokio-tcp-sync")]
pub fn connect_tcp(address: &str, unit: u8, timeout: Duration) -> std::io::Result<Context> {
    use std::net::ToSocketAddrs;

    let socket_addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("'{address}' does not resolve to any socket address"),
        )
    })?;
    let mut ctx = tokio_modbus::client::sync::tcp::connect_slave_with_timeout(
        socket_addr,
        tokio_modbus::Slave(unit),
        Some(timeout),
    )?;
    ctx.set_timeout(timeout);
    Ok(ctx)
}

/// Connects to a meter on a serial RS485 line.
#[cfg(feature = "tokio-rtu-sync")]
pub fn connect_rtu(
    device: &str,
    baud_rate: u32,
    unit: u8,
    timeout: Duration,
) -> std::io::Result<Context> {
    let builder = crate::tokio_common::serial_port_builder(device, baud_rate);
    let mut ctx = tokio_modbus::client::sync::rtu::connect_slave(&builder, tokio_modbus::Slave(unit))?;
    ctx.set_timeout(timeout);
    Ok(ctx)
}
