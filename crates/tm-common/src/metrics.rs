//! Dispatch latency metrics for deferred callbacks.
//!
//! Tracks how late each callback runs relative to its deadline, using a
//! fixed ring of samples so recording never allocates after construction.

use serde::Serialize;

/// Exponential moving average with weight 1/8 for the newest sample.
#[inline]
#[must_use]
pub fn ema_update(average: u64, sample: u64) -> u64 {
    if average == 0 {
        return sample;
    }
    average.saturating_mul(7).saturating_add(sample) / 8
}

/// Dispatch lateness metrics with a ring buffer for percentiles.
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Ring buffer of lateness samples in microseconds.
    samples: Box<[u64]>,
    write_pos: usize,
    /// Number of samples held (saturates at buffer size).
    sample_count: usize,
    total: u64,
    min_us: u64,
    max_us: u64,
    sum_us: u64,
    ema_us: u64,
    late_count: u64,
    late_threshold_us: u64,
}

impl DispatchMetrics {
    /// Create a collector keeping `histogram_size` samples.
    ///
    /// Callbacks running more than `late_threshold_us` after their deadline
    /// are counted as late.
    #[must_use]
    pub fn new(histogram_size: usize, late_threshold_us: u64) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total: 0,
            min_us: u64::MAX,
            max_us: 0,
            sum_us: 0,
            ema_us: 0,
            late_count: 0,
            late_threshold_us,
        }
    }

    /// Record one dispatch that ran `lateness_us` after its deadline.
    pub fn record(&mut self, lateness_us: u64) {
        self.samples[self.write_pos] = lateness_us;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total += 1;
        self.min_us = self.min_us.min(lateness_us);
        self.max_us = self.max_us.max(lateness_us);
        self.sum_us = self.sum_us.wrapping_add(lateness_us);
        self.ema_us = ema_update(self.ema_us, lateness_us);

        if lateness_us > self.late_threshold_us {
            self.late_count += 1;
        }
    }

    /// Total dispatches recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Smallest observed lateness.
    #[must_use]
    pub fn min(&self) -> Option<u64> {
        (self.total > 0).then_some(self.min_us)
    }

    /// Largest observed lateness.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        (self.total > 0).then_some(self.max_us)
    }

    /// Arithmetic mean lateness.
    #[must_use]
    pub fn mean(&self) -> Option<u64> {
        (self.total > 0).then(|| self.sum_us / self.total)
    }

    /// Moving-average lateness.
    #[must_use]
    pub fn average(&self) -> u64 {
        self.ema_us
    }

    /// Dispatches beyond the late threshold.
    #[must_use]
    pub fn late_count(&self) -> u64 {
        self.late_count
    }

    /// Compute a percentile (0.0 to 100.0) over the retained samples.
    ///
    /// Returns `None` if no samples have been collected or if percentile is out of range.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();
        Some(sorted[rank(percentile, sorted.len())])
    }

    /// Compute several percentiles with a single sort.
    ///
    /// Invalid percentiles (< 0, > 100, or NaN) are skipped.
    #[must_use]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, u64)> {
        if self.sample_count == 0 {
            return vec![];
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        percentiles
            .iter()
            .filter(|p| (0.0..=100.0).contains(*p))
            .map(|&p| (p, sorted[rank(p, sorted.len())]))
            .collect()
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            total: self.total,
            min_us: self.min(),
            max_us: self.max(),
            mean_us: self.mean(),
            average_us: self.ema_us,
            late_count: self.late_count,
            p99_us: self.percentile(99.0),
            sample_count: self.sample_count,
        }
    }

    /// Reset all metrics to initial state.
    pub fn reset(&mut self) {
        self.samples.fill(0);
        self.write_pos = 0;
        self.sample_count = 0;
        self.total = 0;
        self.min_us = u64::MAX;
        self.max_us = 0;
        self.sum_us = 0;
        self.ema_us = 0;
        self.late_count = 0;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn rank(percentile: f64, len: usize) -> usize {
    let idx = ((percentile / 100.0) * (len - 1) as f64).round() as usize;
    idx.min(len - 1)
}

/// Immutable snapshot of dispatch metrics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    /// Total dispatches.
    pub total: u64,
    /// Minimum lateness in microseconds.
    pub min_us: Option<u64>,
    /// Maximum lateness in microseconds.
    pub max_us: Option<u64>,
    /// Mean lateness in microseconds.
    pub mean_us: Option<u64>,
    /// Moving-average lateness in microseconds.
    pub average_us: u64,
    /// Dispatches beyond the late threshold.
    pub late_count: u64,
    /// 99th percentile lateness over the retained samples.
    pub p99_us: Option<u64>,
    /// Number of samples retained.
    pub sample_count: usize,
}

impl DispatchSnapshot {
    /// Jitter (max - min) in microseconds.
    #[must_use]
    pub fn jitter_us(&self) -> Option<u64> {
        match (self.min_us, self.max_us) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}
