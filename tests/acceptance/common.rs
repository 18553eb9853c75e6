//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Building managers on a simulated counter
//! - Counting callbacks
//! - Driving 1µs interrupt ticks with a drain after each
//! - Checking real-time prerequisites for the ignored hardware runs

#![allow(dead_code)]

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tm_common::config::TimeManagerConfig;
use tm_runtime::{SimulatedClock, TaskHandle, TimeManager};

/// Manager on a 1 MHz simulated counter that only moves when told to.
pub fn simulated_manager(config: TimeManagerConfig) -> (TimeManager<SimulatedClock>, SimulatedClock) {
    let clock = SimulatedClock::microseconds();
    let manager = TimeManager::with_clock(config, clock.clone()).unwrap();
    (manager, clock)
}

/// Task whose callback counts its invocations.
pub fn counting_task(periodic: bool) -> (TaskHandle, Arc<AtomicU64>) {
    let count = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&count);
    let callback = move |_: &tm_runtime::Expiry| {
        seen.fetch_add(1, Ordering::Relaxed);
    };
    let task = if periodic {
        TaskHandle::periodic(callback)
    } else {
        TaskHandle::one_shot(callback)
    };
    (task, count)
}

/// Advance `micros` in 1µs steps, taking the timer interrupt and draining
/// after every step.
pub fn run_ticks(manager: &TimeManager<SimulatedClock>, clock: &SimulatedClock, micros: u64) {
    for _ in 0..micros {
        clock.advance_micros(1);
        manager.timer_isr();
        manager.drain_deferred(0, 0);
    }
}

/// Read a callback counter.
pub fn fired(count: &AtomicU64) -> u64 {
    count.load(Ordering::Relaxed)
}

/// Deterministic xorshift64 generator for randomized operation sequences.
#[derive(Debug, Clone)]
pub struct XorShift(u64);

impl XorShift {
    /// Seeded generator; a zero seed is replaced.
    pub fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    /// Next raw value.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Value in `0..bound`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }
}

/// Check if the system has a PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    fs::read_to_string("/proc/version")
        .map(|version| version.contains("PREEMPT_RT") || version.contains("PREEMPT RT"))
        .unwrap_or(false)
}

/// Check if running as root (required for real-time priority).
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Current resident memory in bytes.
pub fn get_memory_usage() -> u64 {
    let Ok(status) = fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

/// Acceptance limits for hardware runs.
pub struct AcceptanceCriteria {
    /// Maximum acceptable 99th percentile dispatch lateness in microseconds.
    pub max_p99_us: u64,
    /// Maximum acceptable deferred-queue drops.
    pub max_dropped: u64,
}

impl Default for AcceptanceCriteria {
    fn default() -> Self {
        Self {
            max_p99_us: 2_000,
            max_dropped: 0,
        }
    }
}

impl AcceptanceCriteria {
    /// Limits when running with real-time priority on PREEMPT_RT.
    pub fn realtime() -> Self {
        Self {
            max_p99_us: 200,
            max_dropped: 0,
        }
    }

    /// Check a run against the limits.
    pub fn check(&self, p99_us: Option<u64>, dropped: u64) -> bool {
        p99_us.is_some_and(|p99| p99 <= self.max_p99_us) && dropped <= self.max_dropped
    }
}

/// Config for hardware runs: hosted ISR thread at `interval`.
pub fn hardware_config(interval: Duration) -> TimeManagerConfig {
    let mut config = TimeManagerConfig::default();
    config.isr_thread.interval = interval;
    config.drain.max_tasks = 0;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_is_deterministic() {
        let mut a = XorShift::new(7);
        let mut b = XorShift::new(7);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        assert!(XorShift::new(0).below(10) < 10);
    }

    #[test]
    fn test_acceptance_criteria() {
        let criteria = AcceptanceCriteria::default();
        assert!(criteria.check(Some(150), 0));
        assert!(!criteria.check(Some(5_000), 0));
        assert!(!criteria.check(Some(10), 1));
        assert!(!criteria.check(None, 0));
    }
}
