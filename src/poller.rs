//! The poll-publish loop.
//!
//! [`PollLoop`] owns the register bus and the transport [`Publisher`] and
//! drives them through `Setup -> Polling -> Draining -> Terminated`:
//!
//! * **Setup** syncs the device clock (optional) and starts the transport's
//!   background delivery without waiting for the connection to complete.
//! * **Polling** repeats sample, stamp, publish, sleep. A shutdown request is
//!   only looked at between cycles, so a cycle is never cut short.
//! * **Draining** always runs once polling has started: the transport is
//!   flushed and stopped first, then the wire connection is closed.
//!
//! The result is an [`Outcome`] whose [`Outcome::exit_code`] is `0` for a
//! requested shutdown and `1` for a fault.

use crate::{
    bus::RegisterBus,
    clock,
    sampler::{self, Reading},
    tokio_common,
};
use chrono::NaiveDateTime;
use log::*;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// The transport boundary.
///
/// Delivery guarantees, buffering and reconnects are the implementation's
/// business; the loop only hands over payloads.
pub trait Publisher {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Starts background delivery. Must not wait for the connection.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Queues one payload for at-least-once delivery.
    fn publish(&mut self, payload: String) -> Result<(), Self::Error>;

    /// Flushes outstanding deliveries and stops background delivery.
    fn drain(self) -> Result<(), Self::Error>
    where
        Self: Sized;
}

/// Errors that end the poll loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Device communication failed: {0}")]
    Device(#[from] tokio_common::Error),
    #[error("Transport failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    fn transport<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Transport(Box::new(err))
    }
}

/// Lifecycle of a [`PollLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Setup,
    Polling,
    Draining,
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Setup => "setup",
            State::Polling => "polling",
            State::Draining => "draining",
            State::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How the loop ended.
#[derive(Debug)]
pub enum Outcome {
    /// Shutdown was requested and honoured between cycles.
    Interrupted { cycles: u64 },
    /// Setup, a register read or a publish failed.
    Faulted { cycles: u64, error: Error },
}

impl Outcome {
    /// Completed poll-publish cycles.
    pub fn cycles(&self) -> u64 {
        match self {
            Outcome::Interrupted { cycles } | Outcome::Faulted { cycles, .. } => *cycles,
        }
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Interrupted { .. } => 0,
            Outcome::Faulted { .. } => 1,
        }
    }
}

/// Cancellation token shared between the signal handler and the loop.
///
/// Cancelling only sets a flag (and wakes a sleeping loop); the loop reads it
/// once before each cycle.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `timeout` or until cancelled. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Settings of the poll loop.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Pause between two cycles.
    pub interval: Duration,
    /// Clock drift that triggers a device clock rewrite during setup.
    pub drift_threshold: Duration,
    /// Whether setup compares and corrects the device clock.
    pub sync_clock: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            drift_threshold: clock::DEFAULT_DRIFT_THRESHOLD,
            sync_clock: true,
        }
    }
}

/// Drives sampling and publishing until shutdown or the first fault.
pub struct PollLoop<B, P> {
    bus: B,
    publisher: P,
    config: PollConfig,
    shutdown: ShutdownToken,
    local_now: fn() -> NaiveDateTime,
}

fn transition(state: &mut State, next: State) {
    debug!("Poll loop: {state} -> {next}");
    *state = next;
}

impl<B: RegisterBus, P: Publisher> PollLoop<B, P> {
    pub fn new(bus: B, publisher: P, config: PollConfig, shutdown: ShutdownToken) -> Self {
        Self {
            bus,
            publisher,
            config,
            shutdown,
            local_now: clock::local_now,
        }
    }

    /// Replaces the wall clock used for device clock sync.
    pub fn with_local_clock(mut self, local_now: fn() -> NaiveDateTime) -> Self {
        self.local_now = local_now;
        self
    }

    /// Runs the loop to completion.
    pub fn run(self) -> Outcome {
        let PollLoop {
            mut bus,
            mut publisher,
            config,
            shutdown,
            local_now,
        } = self;
        let mut state = State::Setup;

        if let Err(error) = Self::setup(&mut bus, &mut publisher, &config, local_now) {
            error!("Setup failed: {error}");
            bus.close();
            transition(&mut state, State::Terminated);
            return Outcome::Faulted { cycles: 0, error };
        }

        transition(&mut state, State::Polling);
        let mut cycles = 0u64;
        let fault = loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested after {cycles} cycles");
                break None;
            }
            if let Err(error) = Self::poll_once(&mut bus, &mut publisher) {
                break Some(error);
            }
            cycles += 1;
            if shutdown.wait_timeout(config.interval) {
                debug!("Woken by shutdown request");
            }
        };

        transition(&mut state, State::Draining);
        info!("Emptying message queue and stopping transport");
        if let Err(err) = publisher.drain() {
            warn!("Draining the transport failed: {err}");
        }
        bus.close();
        transition(&mut state, State::Terminated);

        match fault {
            None => Outcome::Interrupted { cycles },
            Some(error) => {
                error!("Poll loop stopped after {cycles} cycles: {error}");
                Outcome::Faulted { cycles, error }
            }
        }
    }

    fn setup(
        bus: &mut B,
        publisher: &mut P,
        config: &PollConfig,
        local_now: fn() -> NaiveDateTime,
    ) -> Result<(), Error> {
        if config.sync_clock {
            clock::sync_if_drifted(bus, config.drift_threshold, local_now)?;
        }
        info!("Starting transport");
        publisher.start().map_err(Error::transport)
    }

    fn poll_once(bus: &mut B, publisher: &mut P) -> Result<(), Error> {
        let reading = Reading::capture(sampler::sample(bus)?);
        trace!("Publishing: {}", reading.record);
        publisher
            .publish(reading.to_payload())
            .map_err(Error::transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{transport_error, MemoryBus};
    use crate::protocol::NUMBER_OF_FIELDS;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Events = Rc<RefCell<Vec<&'static str>>>;

    fn device_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 14)
            .unwrap()
            .and_hms_opt(22, 13, 20)
            .unwrap()
    }

    fn drifted_time() -> NaiveDateTime {
        device_time() + chrono::TimeDelta::minutes(5)
    }

    struct TrackedBus {
        inner: MemoryBus,
        events: Events,
        reads: usize,
        /// Read number (1-based) that fails.
        fail_at_read: Option<usize>,
        /// Read number (1-based) during which shutdown is requested.
        cancel_at_read: Option<(usize, ShutdownToken)>,
    }

    impl RegisterBus for TrackedBus {
        fn read_holding_registers(
            &mut self,
            address: u16,
            quantity: u16,
        ) -> tokio_common::Result<Vec<u16>> {
            self.reads += 1;
            if let Some((at, token)) = &self.cancel_at_read {
                if *at == self.reads {
                    token.cancel();
                }
            }
            if self.fail_at_read == Some(self.reads) {
                return Err(transport_error());
            }
            self.inner.read_holding_registers(address, quantity)
        }

        fn write_registers(&mut self, address: u16, words: &[u16]) -> tokio_common::Result<()> {
            self.events.borrow_mut().push("clock write");
            self.inner.write_registers(address, words)
        }

        fn close(self) {
            self.events.borrow_mut().push("close");
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("broker unreachable")]
    struct BrokerError;

    struct MockPublisher {
        events: Events,
        published: Rc<RefCell<Vec<String>>>,
        /// Publish number (1-based) that fails.
        fail_at: Option<usize>,
        /// Publish number (1-based) during which shutdown is requested.
        cancel_at: Option<(usize, ShutdownToken)>,
        fail_start: bool,
    }

    impl Publisher for MockPublisher {
        type Error = BrokerError;

        fn start(&mut self) -> Result<(), BrokerError> {
            self.events.borrow_mut().push("start");
            if self.fail_start {
                Err(BrokerError)
            } else {
                Ok(())
            }
        }

        fn publish(&mut self, payload: String) -> Result<(), BrokerError> {
            let count = self.published.borrow().len() + 1;
            if self.fail_at == Some(count) {
                return Err(BrokerError);
            }
            if let Some((at, token)) = &self.cancel_at {
                if *at == count {
                    token.cancel();
                }
            }
            self.events.borrow_mut().push("publish");
            self.published.borrow_mut().push(payload);
            Ok(())
        }

        fn drain(self) -> Result<(), BrokerError> {
            self.events.borrow_mut().push("drain");
            Ok(())
        }
    }

    struct Fixture {
        events: Events,
        published: Rc<RefCell<Vec<String>>>,
        shutdown: ShutdownToken,
        bus: TrackedBus,
        publisher: MockPublisher,
    }

    impl Fixture {
        fn new() -> Self {
            let events = Events::default();
            let published = Rc::new(RefCell::new(Vec::new()));
            let mut inner = MemoryBus::default();
            clock::write_device_clock(&mut inner, &device_time()).unwrap();
            Self {
                bus: TrackedBus {
                    inner,
                    events: events.clone(),
                    reads: 0,
                    fail_at_read: None,
                    cancel_at_read: None,
                },
                publisher: MockPublisher {
                    events: events.clone(),
                    published: published.clone(),
                    fail_at: None,
                    cancel_at: None,
                    fail_start: false,
                },
                events,
                published,
                shutdown: ShutdownToken::new(),
            }
        }

        fn run(self) -> (Outcome, Vec<&'static str>, Vec<String>) {
            self.run_every(Duration::ZERO)
        }

        fn run_every(self, interval: Duration) -> (Outcome, Vec<&'static str>, Vec<String>) {
            let config = PollConfig {
                interval,
                ..Default::default()
            };
            let outcome = PollLoop::new(self.bus, self.publisher, config, self.shutdown)
                .with_local_clock(device_time)
                .run();
            let events = self.events.borrow().clone();
            let published = self.published.borrow().clone();
            (outcome, events, published)
        }
    }

    fn count(events: &[&str], name: &str) -> usize {
        events.iter().filter(|e| **e == name).count()
    }

    #[test]
    fn shutdown_between_cycles_stops_cleanly() {
        let mut fixture = Fixture::new();
        fixture.publisher.cancel_at = Some((3, fixture.shutdown.clone()));

        let (outcome, events, published) = fixture.run();

        assert_matches!(outcome, Outcome::Interrupted { cycles: 3 });
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(published.len(), 3);
        assert_eq!(
            events,
            vec!["start", "publish", "publish", "publish", "drain", "close"]
        );
    }

    #[test]
    fn shutdown_before_first_cycle_runs_no_cycle() {
        let fixture = Fixture::new();
        fixture.shutdown.cancel();

        let (outcome, events, published) = fixture.run();

        assert_matches!(outcome, Outcome::Interrupted { cycles: 0 });
        assert_eq!(outcome.exit_code(), 0);
        assert!(published.is_empty());
        assert_eq!(events, vec!["start", "drain", "close"]);
    }

    #[test]
    fn shutdown_during_cycle_finishes_the_cycle() {
        let mut fixture = Fixture::new();
        // read 1 is the clock sync, the request lands in the middle of cycle 1
        fixture.bus.cancel_at_read = Some((6, fixture.shutdown.clone()));

        let (outcome, events, published) = fixture.run();

        assert_matches!(outcome, Outcome::Interrupted { cycles: 1 });
        assert_eq!(published.len(), 1);
        assert_eq!(count(&events, "drain"), 1);
    }

    #[test]
    fn device_error_drains_and_faults() {
        let mut fixture = Fixture::new();
        // fails in the middle of the second cycle
        fixture.bus.fail_at_read = Some(1 + NUMBER_OF_FIELDS + 5);

        let (outcome, events, published) = fixture.run();

        assert_eq!(outcome.exit_code(), 1);
        assert_matches!(
            outcome,
            Outcome::Faulted {
                cycles: 1,
                error: Error::Device(tokio_common::Error::TokioError(..))
            }
        );
        assert_eq!(published.len(), 1);
        assert_eq!(count(&events, "drain"), 1);
        assert_eq!(count(&events, "close"), 1);
        assert_eq!(events[events.len() - 2..], ["drain", "close"]);
    }

    #[test]
    fn publish_error_drains_and_faults() {
        let mut fixture = Fixture::new();
        fixture.publisher.fail_at = Some(2);

        let (outcome, events, _) = fixture.run();

        assert_matches!(
            outcome,
            Outcome::Faulted {
                cycles: 1,
                error: Error::Transport(..)
            }
        );
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(events[events.len() - 2..], ["drain", "close"]);
    }

    #[test]
    fn setup_failure_terminates_without_transport() {
        let mut fixture = Fixture::new();
        fixture.bus.fail_at_read = Some(1);

        let (outcome, events, published) = fixture.run();

        assert_matches!(outcome, Outcome::Faulted { cycles: 0, .. });
        assert_eq!(outcome.exit_code(), 1);
        assert!(published.is_empty());
        assert_eq!(events, vec!["close"]);
    }

    #[test]
    fn transport_start_failure_terminates() {
        let mut fixture = Fixture::new();
        fixture.publisher.fail_start = true;

        let (outcome, events, _) = fixture.run();

        assert_matches!(
            outcome,
            Outcome::Faulted {
                cycles: 0,
                error: Error::Transport(..)
            }
        );
        assert_eq!(events, vec!["start", "close"]);
    }

    #[test]
    fn drifted_clock_is_corrected_before_transport_starts() {
        let fixture = Fixture::new();
        fixture.shutdown.cancel();
        let config = PollConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        let outcome = PollLoop::new(fixture.bus, fixture.publisher, config, fixture.shutdown)
            .with_local_clock(drifted_time)
            .run();

        assert_matches!(outcome, Outcome::Interrupted { cycles: 0 });
        assert_eq!(
            *fixture.events.borrow(),
            vec![
                "clock write",
                "clock write",
                "clock write",
                "start",
                "drain",
                "close"
            ]
        );
    }

    #[test]
    fn published_payload_carries_all_fields() {
        let mut fixture = Fixture::new();
        fixture.publisher.cancel_at = Some((1, fixture.shutdown.clone()));

        let (_, _, published) = fixture.run();

        let payload: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), NUMBER_OF_FIELDS + 1);
        assert!(object["timestamp"].as_f64().unwrap() > 1.6e9);
    }

    #[test]
    fn shutdown_wakes_the_interval_sleep() {
        let fixture = Fixture::new();
        let remote = fixture.shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });

        let started = std::time::Instant::now();
        let (outcome, events, published) = fixture.run_every(Duration::from_secs(30));
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_matches!(outcome, Outcome::Interrupted { cycles: 1 });
        assert_eq!(published.len(), 1);
        assert_eq!(events, vec!["start", "publish", "drain", "close"]);
    }

    #[test]
    fn token_wakes_sleeper() {
        let token = ShutdownToken::new();
        assert!(!token.wait_timeout(Duration::ZERO));

        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let started = std::time::Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(token.is_cancelled());
        handle.join().unwrap();
    }
}
