//! Diagnostics for the Time Manager daemon.
//!
//! Collects manager counters into a [`DiagnosticsSnapshot`] that can be
//! logged, printed as JSON, or rendered in Prometheus text format.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tm_common::state::ManagerState;
use tm_runtime::{DrainStats, IsrStats, MonotonicClock, TimeBaseInfo, TimeManager, TimerHardware};

/// Health of the running manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Callbacks are dispatched on time and nothing is dropped.
    Healthy,
    /// Late dispatches or deferred-queue drops were observed.
    Degraded,
    /// Manager not initialized.
    Starting,
    /// Teardown in progress or finished.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Point-in-time view of the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Derived health.
    pub health: HealthStatus,
    /// Lifecycle state.
    pub state: ManagerState,
    /// Daemon uptime.
    #[serde(serialize_with = "serialize_secs")]
    pub uptime: Duration,
    /// Microseconds since boot on the manager's time base.
    pub now_us: u64,
    /// Calibration summary.
    pub time_base: TimeBaseInfo,
    /// Tasks with a pending deadline.
    pub active_tasks: usize,
    /// Tasks holding a table slot.
    pub registered_tasks: usize,
    /// Interrupt counters.
    pub isr: IsrStats,
    /// Drain and queue counters.
    pub drain: DrainStats,
    /// Callbacks run by the synthetic workload.
    pub workload_callbacks: u64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters the daemon's own workload updates.
#[derive(Debug)]
pub struct DiagnosticsState {
    workload_callbacks: AtomicU64,
    start_time: Instant,
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsState {
    /// Start the uptime clock.
    pub fn new() -> Self {
        Self {
            workload_callbacks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count one workload callback.
    pub fn record_callback(&self) {
        self.workload_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Workload callbacks so far.
    pub fn workload_callbacks(&self) -> u64 {
        self.workload_callbacks.load(Ordering::Relaxed)
    }

    /// Time since the daemon started.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Health from lifecycle state and drain counters.
pub fn health_from(state: ManagerState, drain: &DrainStats) -> HealthStatus {
    match state {
        ManagerState::Uninitialized => HealthStatus::Starting,
        ManagerState::ShuttingDown | ManagerState::Stopped => HealthStatus::ShuttingDown,
        ManagerState::Running => {
            if drain.queue.dropped > 0 || drain.dispatch.late_count > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
    }
}

/// Snapshot `manager` in lifecycle `state`.
pub fn snapshot<C, H>(
    manager: &TimeManager<C, H>,
    state: ManagerState,
    diagnostics: &DiagnosticsState,
) -> DiagnosticsSnapshot
where
    C: MonotonicClock,
    H: TimerHardware,
{
    let drain = manager.drain_stats();
    DiagnosticsSnapshot {
        health: health_from(state, &drain),
        state,
        uptime: diagnostics.uptime(),
        now_us: manager.now_micros(),
        time_base: manager.time_base_info(),
        active_tasks: manager.active_task_count(),
        registered_tasks: manager.registered_task_count(),
        isr: manager.isr_stats(),
        drain,
        workload_callbacks: diagnostics.workload_callbacks(),
    }
}

fn metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {value}\n"));
}

/// Render `snapshot` in Prometheus text exposition format.
pub fn format_prometheus_metrics(snapshot: &DiagnosticsSnapshot) -> String {
    let mut output = String::new();

    output.push_str("# HELP tm_health Time Manager health (1=healthy, 0=not healthy)\n");
    output.push_str("# TYPE tm_health gauge\n");
    output.push_str(&format!(
        "tm_health{{status=\"{}\"}} {}\n",
        snapshot.health,
        u8::from(snapshot.health == HealthStatus::Healthy)
    ));
    output.push_str("# HELP tm_state Lifecycle state\n");
    output.push_str("# TYPE tm_state gauge\n");
    output.push_str(&format!("tm_state{{state=\"{}\"}} 1\n", snapshot.state));

    let uptime = format!("{:.3}", snapshot.uptime.as_secs_f64());
    metric(&mut output, "tm_uptime_seconds", "gauge", "Daemon uptime in seconds", uptime);
    metric(&mut output, "tm_counter_frequency_hz", "gauge", "Calibrated counter frequency", snapshot.time_base.frequency_hz);
    metric(&mut output, "tm_counter_resolution_ns", "gauge", "Measured counter resolution", snapshot.time_base.resolution_ns);
    metric(&mut output, "tm_timer_overhead_ns", "gauge", "Cost of one time read", snapshot.time_base.overhead_ns);
    metric(&mut output, "tm_active_tasks", "gauge", "Tasks with a pending deadline", snapshot.active_tasks);
    metric(&mut output, "tm_registered_tasks", "gauge", "Tasks holding a table slot", snapshot.registered_tasks);

    let isr = &snapshot.isr;
    metric(&mut output, "tm_interrupts_total", "counter", "Timer interrupts serviced", isr.interrupts);
    metric(&mut output, "tm_spurious_interrupts_total", "counter", "Interrupts before the armed time", isr.spurious);
    metric(&mut output, "tm_expired_total", "counter", "Task expirations", isr.expired);
    metric(&mut output, "tm_catch_up_clamps_total", "counter", "Periodic tasks rescheduled from now", isr.catch_up_clamps);
    metric(&mut output, "tm_isr_latency_avg_us", "gauge", "Moving-average interrupt latency", isr.avg_latency_us);
    metric(&mut output, "tm_isr_latency_max_us", "gauge", "Maximum interrupt latency", isr.max_latency_us);

    let drain = &snapshot.drain;
    metric(&mut output, "tm_deferred_enqueued_total", "counter", "Fires published to the deferred queue", drain.queue.enqueued);
    metric(&mut output, "tm_deferred_dropped_total", "counter", "Fires dropped on a full queue", drain.queue.dropped);
    metric(&mut output, "tm_deferred_depth", "gauge", "Undrained fires", drain.queue.depth);
    metric(&mut output, "tm_deferred_peak_depth", "gauge", "Peak undrained fires", drain.queue.peak_depth);
    metric(&mut output, "tm_callbacks_total", "counter", "Callbacks executed", drain.executed);
    metric(&mut output, "tm_stale_total", "counter", "Fires discarded by generation check", drain.stale);
    metric(&mut output, "tm_late_dispatch_total", "counter", "Callbacks past the late threshold", drain.dispatch.late_count);
    metric(&mut output, "tm_dispatch_lateness_avg_us", "gauge", "Moving-average dispatch lateness", drain.dispatch.average_us);
    if let Some(max) = drain.dispatch.max_us {
        metric(&mut output, "tm_dispatch_lateness_max_us", "gauge", "Maximum dispatch lateness", max);
    }
    if let Some(p99) = drain.dispatch.p99_us {
        metric(&mut output, "tm_dispatch_lateness_p99_us", "gauge", "99th percentile dispatch lateness", p99);
    }

    output
}
