//! Microsecond and nanosecond delays on the time base.
//!
//! Delays below `busy_wait_threshold` spin on the counter. Longer delays
//! sleep in `poll_interval` slices and re-check the counter after each one,
//! finishing with a spin once less than a slice remains.

use crate::clock::MonotonicClock;
use crate::timebase::TimeBase;
use std::hint;
use std::time::Duration;
use tm_common::config::DelayConfig;
use tm_common::error::{TmError, TmResult};
use tm_common::time::NANOS_PER_MICRO;

/// Wait at least `micros`. Returns the microseconds actually elapsed.
///
/// # Errors
///
/// [`TmError::Param`] if `micros` exceeds `max_delay`.
pub fn delay_micros<C: MonotonicClock>(
    time_base: &TimeBase<C>,
    micros: u64,
    config: &DelayConfig,
) -> TmResult<u64> {
    let requested = Duration::from_micros(micros);
    check_limit(requested, config)?;

    let start = time_base.now_micros();
    let target = start.saturating_add(micros);

    if requested >= config.busy_wait_threshold {
        let slice_us = u64::try_from(config.poll_interval.as_micros())
            .unwrap_or(u64::MAX)
            .max(1);
        loop {
            let now = time_base.now_micros();
            let remaining = target.saturating_sub(now);
            if remaining <= slice_us {
                break;
            }
            sleep(Duration::from_micros(slice_us.min(remaining - slice_us)));
        }
    }

    while time_base.now_micros() < target {
        hint::spin_loop();
    }
    Ok(time_base.now_micros().saturating_sub(start))
}

/// Wait at least `nanos`. Returns the nanoseconds actually elapsed.
///
/// Whole microseconds go through [`delay_micros`]; the remainder spins on
/// raw counts.
///
/// # Errors
///
/// [`TmError::Param`] if `nanos` exceeds `max_delay`.
pub fn delay_nanos<C: MonotonicClock>(
    time_base: &TimeBase<C>,
    nanos: u64,
    config: &DelayConfig,
) -> TmResult<u64> {
    check_limit(Duration::from_nanos(nanos), config)?;

    let start = time_base.read_counter();
    let micros = nanos / NANOS_PER_MICRO;
    if micros > 0 {
        delay_micros(time_base, micros, config)?;
    }

    let mut counts = time_base.ns_to_duration(nanos);
    if time_base.duration_to_ns(counts) < nanos {
        counts += 1;
    }
    let target = start.saturating_add(counts);
    while time_base.read_counter() < target {
        hint::spin_loop();
    }
    Ok(time_base.duration_to_ns(time_base.read_counter().saturating_sub(start)))
}

fn check_limit(requested: Duration, config: &DelayConfig) -> TmResult<()> {
    if requested > config.max_delay {
        return Err(TmError::param(format!(
            "delay {requested:?} exceeds limit {:?}",
            config.max_delay
        )));
    }
    Ok(())
}

/// Relative sleep on the monotonic clock.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn sleep(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::try_from(duration.subsec_nanos()).unwrap_or(0),
    };
    // SAFETY: ts is a valid timespec and the remainder pointer may be null
    unsafe {
        libc::clock_nanosleep(libc::CLOCK_MONOTONIC, 0, &ts, std::ptr::null_mut());
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}
