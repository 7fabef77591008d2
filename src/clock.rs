//! Wall-clock implementations of the timer and delay traits used by the protocol layers
use embedded_hal::delay::DelayNs;
use fugit::{TimerDurationU32, TimerInstantU32};
use fugit_timer::Timer;
use std::thread;
use std::time::{Duration, Instant};

/// Tick rate of [SysTimer]
pub const SYS_TIMER_HZ: u32 = 1_000;

/// A timer with millisecond precision.
pub struct SysTimer {
    origin: Instant,
    start: Instant,
    duration_ms: u32,
}

impl SysTimer {
    pub fn new() -> Self {
        let now = Instant::now();

        Self {
            origin: now,
            start: now,
            duration_ms: 0,
        }
    }
}

impl Default for SysTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer<SYS_TIMER_HZ> for SysTimer {
    type Error = &'static str;

    /// Milliseconds since creation, wrapping after ~49 days
    fn now(&mut self) -> TimerInstantU32<SYS_TIMER_HZ> {
        TimerInstantU32::from_ticks(self.origin.elapsed().as_millis() as u32)
    }

    fn start(&mut self, duration: TimerDurationU32<SYS_TIMER_HZ>) -> Result<(), Self::Error> {
        self.start = Instant::now();
        self.duration_ms = duration.ticks();
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Self::Error> {
        self.duration_ms = 0;
        Ok(())
    }

    /// Returns `WouldBlock` until the started duration has expired
    fn wait(&mut self) -> nb::Result<(), Self::Error> {
        if self.start.elapsed() >= Duration::from_millis(self.duration_ms.into()) {
            return Ok(());
        }

        Err(nb::Error::WouldBlock)
    }
}

/// Blocking delay sleeping the current thread
#[derive(Copy, Clone, Debug, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns.into()));
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}
