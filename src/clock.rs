//! Device time synchronisation.
//!
//! The meter keeps its own real-time clock for tariff switching. At start-up
//! the collector compares it with the local wall clock and rewrites it when
//! the two have drifted apart.

use crate::{bus::RegisterBus, protocol::DeviceClock, tokio_common::Result};
use chrono::NaiveDateTime;
use log::*;
use std::time::Duration;

/// Drift above which the device clock gets rewritten.
pub const DEFAULT_DRIFT_THRESHOLD: Duration = Duration::from_secs(10);

/// Current local wall-clock time, the reference the device clock follows.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Reads the device clock with a single request for the three clock registers.
pub fn read_device_clock<B: RegisterBus + ?Sized>(bus: &mut B) -> Result<NaiveDateTime> {
    let words = bus.read_holding_registers(DeviceClock::ADDRESS, DeviceClock::QUANTITY)?;
    Ok(DeviceClock::decode_from_holding_registers(&words)?)
}

/// Writes `time` to the device clock.
///
/// The three clock registers are written one request at a time. This is not
/// atomic: when a later write fails the earlier ones stay applied and the
/// device clock is inconsistent until the next successful write. Nothing is
/// retried.
pub fn write_device_clock<B: RegisterBus + ?Sized>(bus: &mut B, time: &NaiveDateTime) -> Result<()> {
    let words = DeviceClock::encode_for_write_registers(time)?;
    for (address, word) in (DeviceClock::ADDRESS..).zip(words) {
        bus.write_registers(address, &[word])?;
    }
    Ok(())
}

/// Outcome of [`sync_if_drifted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSync {
    /// Drift within the threshold, nothing written.
    InSync {
        device_time: NaiveDateTime,
        drift: Duration,
    },
    /// Device clock rewritten; `device_time` is the value read back afterwards.
    Corrected {
        previous: NaiveDateTime,
        drift: Duration,
        device_time: NaiveDateTime,
    },
}

impl ClockSync {
    pub fn drift(&self) -> Duration {
        match self {
            ClockSync::InSync { drift, .. } | ClockSync::Corrected { drift, .. } => *drift,
        }
    }
}

/// Absolute difference between two clock readings, millisecond resolution.
fn drift_between(a: NaiveDateTime, b: NaiveDateTime) -> Duration {
    Duration::from_millis(a.signed_duration_since(b).num_milliseconds().unsigned_abs())
}

/// Rewrites the device clock if it is more than `threshold` away from
/// `local_now()`, then reads it back once to confirm.
pub fn sync_if_drifted<B, F>(bus: &mut B, threshold: Duration, mut local_now: F) -> Result<ClockSync>
where
    B: RegisterBus + ?Sized,
    F: FnMut() -> NaiveDateTime,
{
    let local_time = local_now();
    let device_time = read_device_clock(bus)?;
    let drift = drift_between(local_time, device_time);

    info!("device time: {device_time}");
    info!("local time:  {local_time}");
    if drift <= threshold {
        debug!("Clock drift {drift:?} within {threshold:?}");
        return Ok(ClockSync::InSync { device_time, drift });
    }

    warn!("Local and device time differ by {drift:?}, syncing device time");
    write_device_clock(bus, &local_now())?;
    let updated = read_device_clock(bus)?;
    info!("updated device time: {updated}");
    Ok(ClockSync::Corrected {
        previous: device_time,
        drift,
        device_time: updated,
    })
}
