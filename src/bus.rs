//! The wire boundary: raw access to the meter's holding registers.

use crate::tokio_common::Result;

/// Blocking access to the holding registers of one Modbus unit.
///
/// Implemented for [`tokio_modbus::client::sync::Context`] in
/// [`crate::tokio_sync`]; tests provide in-memory implementations.
pub trait RegisterBus {
    /// Reads `quantity` consecutive holding registers starting at `address`.
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>>;

    /// Writes consecutive holding registers starting at `address`.
    fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()>;

    /// Closes the connection. Called once during shutdown.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

impl<B: RegisterBus + ?Sized> RegisterBus for &mut B {
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        (**self).read_holding_registers(address, quantity)
    }

    fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        (**self).write_registers(address, words)
    }
}
