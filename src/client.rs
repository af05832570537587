use crate::{
    bus::RegisterBus,
    clock::{self, ClockSync},
    protocol as proto,
    sampler::{self, TelemetryRecord},
    tokio_common::Result,
};
use chrono::NaiveDateTime;
use log::*;
use std::time::{Duration, Instant};

/// Stateful client for the WE-515 energy meter.
///
/// This struct owns the register bus and offers the meter operations used by
/// the command line tool: reading telemetry, reading and setting the device
/// clock and configuring the tariff schedule.
#[derive(Debug)]
pub struct WE515<B> {
    bus: B,
    exec_delay: Duration,
    last_request: Option<Instant>,
}

/// Bus view that keeps at least `delay` between the end of one request and
/// the start of the next.
struct Paced<'a, B> {
    bus: &'a mut B,
    delay: Duration,
    last_request: &'a mut Option<Instant>,
}

impl<B: RegisterBus> Paced<'_, B> {
    fn wait(&self) {
        if let Some(last) = *self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                std::thread::sleep(self.delay - elapsed);
            }
        }
    }

    fn done<T>(&mut self, result: Result<T>) -> Result<T> {
        *self.last_request = Some(Instant::now());
        result
    }
}

impl<B: RegisterBus> RegisterBus for Paced<'_, B> {
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.wait();
        let result = self.bus.read_holding_registers(address, quantity);
        self.done(result)
    }

    fn write_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        self.wait();
        let result = self.bus.write_registers(address, words);
        self.done(result)
    }
}

impl<B: RegisterBus> WE515<B> {
    /// Creates a new client on top of an established register bus.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use we515_lib::{client::WE515, tokio_sync};
    /// use std::time::Duration;
    ///
    /// # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    /// let ctx = tokio_sync::connect_tcp("192.168.1.11:8899", 1, Duration::from_secs(1))?;
    /// let mut client = WE515::new(ctx);
    /// let record = client.read_telemetry()?;
    /// println!("{record}");
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            exec_delay: Duration::ZERO,
            last_request: None,
        }
    }

    /// Sets the minimum gap between two consecutive requests to the meter.
    ///
    /// Applies to the single requests of one operation (e.g. the 16 tariff
    /// register writes) as well as between operations.
    pub fn set_exec_delay(&mut self, delay: Duration) {
        self.exec_delay = delay;
    }

    fn paced(&mut self) -> Paced<'_, B> {
        Paced {
            bus: &mut self.bus,
            delay: self.exec_delay,
            last_request: &mut self.last_request,
        }
    }

    /// Gives the register bus back, e.g. to hand it to a poll loop.
    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Reads all telemetry fields.
    pub fn read_telemetry(&mut self) -> Result<TelemetryRecord> {
        sampler::sample(&mut self.paced())
    }

    /// Reads the device clock.
    pub fn read_clock(&mut self) -> Result<NaiveDateTime> {
        clock::read_device_clock(&mut self.paced())
    }

    /// Writes `time` to the device clock.
    ///
    /// **Note:** the three clock registers are written one after another; a
    /// failure in between leaves the clock partly updated.
    pub fn set_clock(&mut self, time: &NaiveDateTime) -> Result<()> {
        clock::write_device_clock(&mut self.paced(), time)
    }

    /// Rewrites the device clock from local time if it drifted beyond `threshold`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use we515_lib::{client::WE515, clock, tokio_sync};
    /// # use std::time::Duration;
    /// # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    /// # let ctx = tokio_sync::connect_tcp("192.168.1.11:8899", 1, Duration::from_secs(1))?;
    /// let mut client = WE515::new(ctx);
    /// let sync = client.sync_clock(clock::DEFAULT_DRIFT_THRESHOLD)?;
    /// println!("Drift was {:?}", sync.drift());
    /// # Ok(())
    /// # }
    /// ```
    pub fn sync_clock(&mut self, threshold: Duration) -> Result<ClockSync> {
        clock::sync_if_drifted(&mut self.paced(), threshold, clock::local_now)
    }

    /// Programs the two-rate tariff schedule and clears all other slots.
    ///
    /// Registers are written one request each, in ascending order.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use we515_lib::{client::WE515, tokio_sync};
    /// use we515_lib::protocol::{TariffSchedule, TariffTime};
    /// # use std::time::Duration;
    ///
    /// # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    /// # let ctx = tokio_sync::connect_tcp("192.168.1.11:8899", 1, Duration::from_secs(1))?;
    /// # let mut client = WE515::new(ctx);
    /// // Rate 1 from 08:00, rate 2 from 19:00.
    /// let schedule = TariffSchedule {
    ///     rate1_start: "08:00".parse::<TariffTime>()?,
    ///     rate2_start: "19:00".parse::<TariffTime>()?,
    /// };
    /// client.set_tariff_schedule(&schedule)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_tariff_schedule(&mut self, schedule: &proto::TariffSchedule) -> Result<()> {
        let words = schedule.encode_for_write_registers();
        let mut bus = self.paced();
        for (address, word) in (proto::TariffSchedule::ADDRESS..).zip(words) {
            trace!("Writing tariff register {address:#06x} = {word:#06x}");
            bus.write_registers(address, &[word])?;
        }
        Ok(())
    }
}
