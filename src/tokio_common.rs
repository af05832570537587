//! Common error type for talking to the meter, plus serial port settings for
//! the RTU transport.
//!
//! [`Error`] is the single device communication error: any failed register
//! read or write (lost connection, Modbus exception, expired deadline,
//! malformed response) ends up here.
use crate::protocol as proto;

/// Represents all possible errors that can occur during Modbus communication.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`, e.g. a short or undecodable response.
    #[error(transparent)]
    ProtocolError(#[from] proto::Error),

    /// Wraps `tokio_modbus::ExceptionCode`.
    #[error(transparent)]
    TokioExceptionError(#[from] tokio_modbus::ExceptionCode),

    /// Wraps `tokio_modbus::Error`; transport failures and timeouts.
    #[error(transparent)]
    TokioError(#[from] tokio_modbus::Error),
}

impl Error {
    /// True if the request ran into its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::TokioError(tokio_modbus::Error::Transport(err))
                if err.kind() == std::io::ErrorKind::TimedOut
        )
    }
}

/// The result type for meter operations.
pub type Result<T> = std::result::Result<T, crate::tokio_common::Error>;

/// The parity used for serial communication.
#[cfg(feature = "tokio-rtu-sync")]
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::Even;
/// The number of stop bits used for serial communication.
#[cfg(feature = "tokio-rtu-sync")]
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
#[cfg(feature = "tokio-rtu-sync")]
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;
/// Factory default baud rate of the meter.
pub const FACTORY_DEFAULT_BAUD_RATE: u32 = 9600;
/// Factory default Modbus unit address of the meter.
pub const FACTORY_DEFAULT_UNIT: u8 = 0x01;

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
#[cfg(feature = "tokio-rtu-sync")]
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}
