//! Time base calibration and unit conversion.
//!
//! The time base records the counter value at boot and derives two
//! fixed-point ratios from the calibrated frequency:
//!
//! - nanoseconds per count as 32.32
//! - microseconds per count as 16.16
//!
//! Ratios are computed once with [`crate::softdiv`]. Conversions on the hot
//! path are a multiply and a shift.

use crate::clock::{HardwareClock, MonotonicClock};
use crate::softdiv;
use serde::Serialize;
use std::hint;
use std::time::Instant;
use tm_common::config::{CalibrationConfig, CalibrationMethod};
use tm_common::time::{UnsignedWide, MICROS_PER_MILLI, NANOS_PER_MICRO, NANOS_PER_SECOND};
use tracing::{debug, info, warn};

/// Lowest accepted counter frequency.
pub const MIN_FREQUENCY_HZ: u64 = 1_000_000;

const FRAC_32: u32 = 32;
const FRAC_16: u32 = 16;
const HALF_32: u128 = 1 << 31;

/// Summary of the calibrated time base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBaseInfo {
    /// Calibrated counter frequency.
    pub frequency_hz: u64,
    /// Smallest distinguishable interval.
    pub resolution_ns: u64,
    /// Average cost of one timestamp, microseconds.
    pub overhead_us: u64,
    /// Average cost of one timestamp, nanoseconds.
    pub overhead_ns: u64,
    /// Counter source name.
    pub source: &'static str,
    /// Calibration method that produced the frequency.
    pub method: CalibrationMethod,
}

/// Calibrated counter with its boot epoch.
#[derive(Debug)]
pub struct TimeBase<C: MonotonicClock = HardwareClock> {
    clock: C,
    frequency_hz: u64,
    /// 32.32 fixed point
    ns_per_count: u64,
    /// 16.16 fixed point
    us_per_count: u32,
    boot_counter: u64,
    resolution_ns: u64,
    overhead_ns: u64,
    method: CalibrationMethod,
}

impl<C: MonotonicClock> TimeBase<C> {
    /// Calibrate `clock` and record the boot epoch.
    ///
    /// Calibration never fails; a degenerate measurement falls back to
    /// [`MIN_FREQUENCY_HZ`] and only absolute accuracy suffers.
    pub fn new(clock: C, config: &CalibrationConfig) -> Self {
        let (measured, method) = calibrate(&clock, config);
        let mut time_base = Self::from_frequency(clock, measured, method);
        time_base.resolution_ns = time_base.measure_resolution(config.overhead_samples);
        time_base.overhead_ns = time_base.measure_overhead(config.overhead_samples);

        info!(
            frequency_hz = time_base.frequency_hz,
            resolution_ns = time_base.resolution_ns,
            overhead_us = time_base.overhead_ns / NANOS_PER_MICRO,
            source = time_base.clock.source(),
            %method,
            "Time base calibrated"
        );
        time_base
    }

    /// Time base with a known frequency and no measurement.
    pub fn with_frequency(clock: C, frequency_hz: u64) -> Self {
        Self::from_frequency(clock, frequency_hz, CalibrationMethod::Fixed)
    }

    fn from_frequency(clock: C, frequency_hz: u64, method: CalibrationMethod) -> Self {
        let frequency_hz = if frequency_hz < MIN_FREQUENCY_HZ {
            warn!(
                measured_hz = frequency_hz,
                floor_hz = MIN_FREQUENCY_HZ,
                "Counter frequency below floor, clamping"
            );
            MIN_FREQUENCY_HZ
        } else {
            frequency_hz
        };

        // 1e9 << 32 fits in 64 bits and frequency >= 1 MHz, so neither
        // quotient saturates.
        let ns_per_count =
            softdiv::div_wide_saturating(u128::from(NANOS_PER_SECOND) << FRAC_32, frequency_hz)
                .unwrap_or(u64::MAX);
        let us_per_count = softdiv::div_u64(1_000_000 << FRAC_16, frequency_hz)
            .map_or(u32::MAX, |(q, _)| u32::try_from(q).unwrap_or(u32::MAX));
        let resolution_ns = softdiv::div_ceil_u64(NANOS_PER_SECOND, frequency_hz).unwrap_or(1);
        let boot_counter = clock.read_counter();

        Self {
            clock,
            frequency_hz,
            ns_per_count,
            us_per_count,
            boot_counter,
            resolution_ns,
            overhead_ns: 0,
            method,
        }
    }

    /// Underlying clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Calibrated counter frequency.
    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    /// Nanoseconds per count, 32.32 fixed point.
    pub fn ns_per_count(&self) -> u64 {
        self.ns_per_count
    }

    /// Microseconds per count, 16.16 fixed point.
    pub fn us_per_count(&self) -> u32 {
        self.us_per_count
    }

    /// Counter value recorded at boot.
    pub fn boot_counter(&self) -> u64 {
        self.boot_counter
    }

    /// Smallest distinguishable interval in nanoseconds.
    pub fn resolution_ns(&self) -> u64 {
        self.resolution_ns
    }

    /// Resolution rounded up to whole microseconds, at least 1.
    pub fn resolution_us(&self) -> u64 {
        self.resolution_ns.div_ceil(NANOS_PER_MICRO).max(1)
    }

    /// Raw counter value.
    #[inline]
    pub fn read_counter(&self) -> u64 {
        self.clock.read_counter()
    }

    /// Counts elapsed since boot.
    #[inline]
    pub fn counts_since_boot(&self) -> u64 {
        self.clock.read_counter().saturating_sub(self.boot_counter)
    }

    /// Microseconds since boot.
    #[inline]
    pub fn now_micros(&self) -> u64 {
        self.counts_to_micros(self.counts_since_boot())
    }

    /// Nanoseconds since boot.
    pub fn now_nanos(&self) -> u64 {
        self.duration_to_ns(self.counts_since_boot())
    }

    /// Convert counts to microseconds through the 16.16 ratio.
    #[inline]
    pub fn counts_to_micros(&self, counts: u64) -> u64 {
        let scaled = (u128::from(counts) * u128::from(self.us_per_count)) >> FRAC_16;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    /// Convert a count interval to nanoseconds, rounding to nearest.
    #[inline]
    pub fn duration_to_ns(&self, counts: u64) -> u64 {
        let scaled = (u128::from(counts) * u128::from(self.ns_per_count) + HALF_32) >> FRAC_32;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    /// Convert nanoseconds to a count interval, rounding to nearest.
    pub fn ns_to_duration(&self, ns: u64) -> u64 {
        let numerator = (u128::from(ns) << FRAC_32) + u128::from(self.ns_per_count / 2);
        softdiv::div_wide_saturating(numerator, self.ns_per_count).unwrap_or(u64::MAX)
    }

    /// Raw counter as a wide absolute time.
    pub fn absolute_time(&self) -> UnsignedWide {
        UnsignedWide::from_u64(self.read_counter())
    }

    /// Absolute (count) interval to nanoseconds.
    pub fn absolute_to_nanoseconds(&self, absolute: UnsignedWide) -> UnsignedWide {
        UnsignedWide::from_u64(self.duration_to_ns(absolute.to_u64()))
    }

    /// Nanoseconds to an absolute (count) interval.
    pub fn nanoseconds_to_absolute(&self, ns: UnsignedWide) -> UnsignedWide {
        UnsignedWide::from_u64(self.ns_to_duration(ns.to_u64()))
    }

    /// Classic duration (positive milliseconds, negative microseconds) to
    /// counts.
    pub fn duration_to_absolute(&self, duration: i32) -> UnsignedWide {
        let micros = if duration >= 0 {
            u64::from(duration.unsigned_abs()) * MICROS_PER_MILLI
        } else {
            u64::from(duration.unsigned_abs())
        };
        self.nanoseconds_to_absolute(UnsignedWide::from_u64(
            micros.saturating_mul(NANOS_PER_MICRO),
        ))
    }

    /// Counts to a classic duration.
    ///
    /// Intervals that fit are returned as negative microseconds; longer ones
    /// as positive milliseconds, saturating at `i32::MAX`.
    pub fn absolute_to_duration(&self, absolute: UnsignedWide) -> i32 {
        let micros = self.duration_to_ns(absolute.to_u64()) / NANOS_PER_MICRO;
        if micros == 0 {
            return 0;
        }
        match i32::try_from(micros) {
            Ok(us) => -us,
            Err(_) => i32::try_from(micros / MICROS_PER_MILLI).unwrap_or(i32::MAX),
        }
    }

    /// Measured cost of one timestamp.
    pub fn overhead_ns(&self) -> u64 {
        self.overhead_ns
    }

    /// Snapshot for reporting.
    pub fn info(&self) -> TimeBaseInfo {
        TimeBaseInfo {
            frequency_hz: self.frequency_hz,
            resolution_ns: self.resolution_ns,
            overhead_us: self.overhead_ns / NANOS_PER_MICRO,
            overhead_ns: self.overhead_ns,
            source: self.clock.source(),
            method: self.method,
        }
    }

    /// Smallest nonzero step between back-to-back reads, never finer than one
    /// count period.
    fn measure_resolution(&self, samples: u32) -> u64 {
        let mut min_step = u64::MAX;
        let mut previous = self.clock.read_counter();
        for _ in 0..samples {
            let current = self.clock.read_counter();
            let step = current.saturating_sub(previous);
            if step > 0 {
                min_step = min_step.min(step);
            }
            previous = current;
        }

        let tick_ns = self.resolution_ns;
        if min_step == u64::MAX {
            debug!(tick_ns, "Counter did not move while sampling resolution");
            return tick_ns;
        }
        self.duration_to_ns(min_step).max(tick_ns)
    }

    fn measure_overhead(&self, samples: u32) -> u64 {
        if samples == 0 {
            return 0;
        }
        let start = self.clock.read_counter();
        for _ in 0..samples {
            hint::black_box(self.now_micros());
        }
        let elapsed = self.clock.read_counter().saturating_sub(start);
        self.duration_to_ns(elapsed) / u64::from(samples)
    }
}

fn calibrate<C: MonotonicClock>(
    clock: &C,
    config: &CalibrationConfig,
) -> (u64, CalibrationMethod) {
    match config.method {
        CalibrationMethod::Auto => match clock.nominal_frequency().filter(|&hz| hz > 0) {
            Some(hz) => (hz, CalibrationMethod::Nominal),
            None => (calibrate_reference(clock, config), CalibrationMethod::Reference),
        },
        CalibrationMethod::Nominal => match clock.nominal_frequency().filter(|&hz| hz > 0) {
            Some(hz) => (hz, CalibrationMethod::Nominal),
            None => {
                warn!("Clock declares no frequency, calibrating against the OS clock");
                (calibrate_reference(clock, config), CalibrationMethod::Reference)
            }
        },
        CalibrationMethod::Reference => {
            (calibrate_reference(clock, config), CalibrationMethod::Reference)
        }
        CalibrationMethod::BusyLoop => {
            (calibrate_busy_loop(clock, config), CalibrationMethod::BusyLoop)
        }
        CalibrationMethod::Fixed => match config.frequency_hz {
            Some(hz) => (hz, CalibrationMethod::Fixed),
            None => {
                warn!("Fixed calibration without a frequency, using the floor");
                (MIN_FREQUENCY_HZ, CalibrationMethod::Fixed)
            }
        },
    }
}

/// Count ticks across a window timed by the OS monotonic clock.
fn calibrate_reference<C: MonotonicClock>(clock: &C, config: &CalibrationConfig) -> u64 {
    let started = Instant::now();
    let first = clock.read_counter();
    while started.elapsed() < config.window {
        hint::spin_loop();
    }
    let last = clock.read_counter();
    let elapsed_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

    let counts = last.saturating_sub(first);
    let hz = softdiv::div_wide_saturating(
        u128::from(counts) * u128::from(NANOS_PER_SECOND),
        elapsed_ns,
    )
    .unwrap_or(0);
    debug!(counts, elapsed_ns, hz, "Reference calibration");
    hz
}

/// Count ticks across a busy loop of assumed duration.
fn calibrate_busy_loop<C: MonotonicClock>(clock: &C, config: &CalibrationConfig) -> u64 {
    let first = clock.read_counter();
    for i in 0..config.busy_loop_iterations {
        hint::black_box(i);
    }
    let last = clock.read_counter();

    let per_iteration_ns = u64::try_from(config.assumed_iteration.as_nanos()).unwrap_or(u64::MAX);
    let assumed_ns = config.busy_loop_iterations.saturating_mul(per_iteration_ns);
    let counts = last.saturating_sub(first);
    let hz = softdiv::div_wide_saturating(
        u128::from(counts) * u128::from(NANOS_PER_SECOND),
        assumed_ns,
    )
    .unwrap_or(0);
    debug!(counts, assumed_ns, hz, "Busy-loop calibration");
    hz
}
