//! Monotonic counter sources.
//!
//! The time base only needs raw, non-decreasing counts. [`HardwareClock`]
//! reads the architecture counter; [`SimulatedClock`] is a shared software
//! counter that tests and simulations advance explicitly.

use crate::arch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic counter.
pub trait MonotonicClock: Send + Sync {
    /// Current raw count. Side-effect free and non-decreasing within one boot.
    fn read_counter(&self) -> u64;

    /// Frequency the source declares, if any. Skips calibration when known.
    fn nominal_frequency(&self) -> Option<u64> {
        None
    }

    /// Short name of the counter source for diagnostics.
    fn source(&self) -> &'static str;
}

/// Architecture cycle counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareClock;

impl MonotonicClock for HardwareClock {
    #[inline]
    fn read_counter(&self) -> u64 {
        arch::read_counter()
    }

    fn nominal_frequency(&self) -> Option<u64> {
        arch::nominal_frequency()
    }

    fn source(&self) -> &'static str {
        arch::counter_source()
    }
}

/// Software counter shared between clones.
///
/// Counts only move when advanced, unless an auto-step is configured, in
/// which case every read also advances the counter.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    ticks: Arc<AtomicU64>,
    frequency_hz: u64,
    auto_step: u64,
}

impl SimulatedClock {
    /// New counter at zero with the given declared frequency.
    #[must_use]
    pub fn new(frequency_hz: u64) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            frequency_hz,
            auto_step: 0,
        }
    }

    /// Counter ticking at 1 MHz, so one count is one microsecond.
    #[must_use]
    pub fn microseconds() -> Self {
        Self::new(1_000_000)
    }

    /// Advance by `step` counts on every read.
    #[must_use]
    pub fn with_auto_step(mut self, step: u64) -> Self {
        self.auto_step = step;
        self
    }

    /// Advance by raw counts.
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }

    /// Advance by microseconds at the declared frequency.
    pub fn advance_micros(&self, micros: u64) {
        let ticks = u128::from(micros) * u128::from(self.frequency_hz) / 1_000_000;
        self.advance(u64::try_from(ticks).unwrap_or(u64::MAX));
    }

    /// Move to an absolute count; never moves backwards.
    pub fn set(&self, ticks: u64) {
        self.ticks.fetch_max(ticks, Ordering::AcqRel);
    }

    /// Current count without auto-stepping.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl MonotonicClock for SimulatedClock {
    #[inline]
    fn read_counter(&self) -> u64 {
        if self.auto_step == 0 {
            self.ticks.load(Ordering::Acquire)
        } else {
            self.ticks.fetch_add(self.auto_step, Ordering::AcqRel) + self.auto_step
        }
    }

    fn nominal_frequency(&self) -> Option<u64> {
        Some(self.frequency_hz)
    }

    fn source(&self) -> &'static str {
        "simulated"
    }
}

impl<C: MonotonicClock + ?Sized> MonotonicClock for Arc<C> {
    #[inline]
    fn read_counter(&self) -> u64 {
        (**self).read_counter()
    }

    fn nominal_frequency(&self) -> Option<u64> {
        (**self).nominal_frequency()
    }

    fn source(&self) -> &'static str {
        (**self).source()
    }
}
