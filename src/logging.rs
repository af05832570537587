//! Logger setup shared by the `powermeter` and `mqtt2influx` binaries.

use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use log::{error, LevelFilter};
use std::any::Any;
use std::panic::{self, PanicHookInfo};

/// Starts logging at `level` (overridable via `RUST_LOG`) and routes panics
/// into the log. Keep the returned handle alive for the program's lifetime.
pub fn init(level: LevelFilter) -> Result<LoggerHandle, FlexiLoggerError> {
    let handle = Logger::try_with_env_or_str(level.as_str())?.start()?;
    panic::set_hook(Box::new(log_panic));
    Ok(handle)
}

fn panic_cause(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<unknown panic cause>")
}

fn log_panic(info: &PanicHookInfo<'_>) {
    let thread = std::thread::current();
    let location = info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| String::from("<unknown location>"));
    error!(
        target: "panic",
        "Thread '{}' panicked at {location}: {}",
        thread.name().unwrap_or("<unnamed>"),
        panic_cause(info.payload())
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_cause_from_payload() {
        let payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_cause(&*payload), "static message");

        let channel = 3;
        let payload = panic::catch_unwind(|| panic!("formatted {channel}")).unwrap_err();
        assert_eq!(panic_cause(&*payload), "formatted 3");

        let payload = panic::catch_unwind(|| panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_cause(&*payload), "<unknown panic cause>");
    }
}
