//! Dispatch latency on the hardware counter.
//!
//! A set of periodic tasks runs under the hosted timer thread while the test
//! thread drains; lateness is taken from the manager's dispatch metrics.
//!
//! # Requirements
//!
//! - Root privileges and PREEMPT_RT for the real-time variant
//!
//! # Acceptance Criteria
//!
//! - 99th percentile dispatch lateness within [`AcceptanceCriteria`]
//! - No deferred-queue drops

use super::common::{hardware_config, has_preempt_rt, is_root, AcceptanceCriteria};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_common::config::{RealtimeConfig, SchedPolicy};
use tm_runtime::{DrainStats, IsrTicker, TaskHandle, TimeManager};

fn run_workload(
    config: tm_common::config::TimeManagerConfig,
    tasks: usize,
    period_us: u64,
    duration: Duration,
) -> DrainStats {
    let isr_thread = config.isr_thread.clone();
    let manager = Arc::new(TimeManager::new(config).unwrap());
    let handles: Vec<_> = (0..tasks).map(|_| TaskHandle::periodic(|_| {})).collect();
    for (i, task) in handles.iter().enumerate() {
        manager.insert(task).unwrap();
        manager.prime(task, period_us + i as u64).unwrap();
    }

    let mut ticker = IsrTicker::start(Arc::clone(&manager), &isr_thread).unwrap();
    let start = Instant::now();
    while start.elapsed() < duration {
        if manager.drain_deferred(0, 0).dequeued == 0 {
            std::thread::sleep(Duration::from_micros(50));
        }
    }
    ticker.stop();
    manager.drain_deferred(0, 0);

    let stats = manager.drain_stats();
    println!(
        "tasks={tasks} period={period_us}us executed={} stale={} dropped={} avg={}us p99={:?}us max={:?}us interrupts={}",
        stats.executed,
        stats.stale,
        stats.queue.dropped,
        stats.dispatch.average_us,
        stats.dispatch.p99_us,
        stats.dispatch.max_us,
        manager.isr_stats().interrupts,
    );
    manager.shutdown();
    stats
}

/// Baseline at normal priority.
#[test]
#[ignore = "Timing-sensitive, run on a quiet host"]
fn test_dispatch_latency_normal_priority() {
    let stats = run_workload(
        hardware_config(Duration::from_micros(20)),
        8,
        1_000,
        Duration::from_secs(5),
    );
    assert!(stats.executed > 0);
    assert!(
        AcceptanceCriteria::default().check(stats.dispatch.p99_us, stats.queue.dropped),
        "p99={:?}us dropped={}",
        stats.dispatch.p99_us,
        stats.queue.dropped
    );
}

/// Timer thread at SCHED_FIFO with locked memory.
#[test]
#[ignore = "Requires root and a PREEMPT_RT kernel"]
fn test_dispatch_latency_realtime() {
    if !is_root() || !has_preempt_rt() {
        eprintln!("Skipping test: needs root and PREEMPT_RT");
        return;
    }

    let mut config = hardware_config(Duration::from_micros(10));
    config.isr_thread.realtime = RealtimeConfig {
        enabled: true,
        policy: SchedPolicy::Fifo,
        priority: 90,
        lock_memory: true,
        ..RealtimeConfig::default()
    };
    let stats = run_workload(config, 16, 500, Duration::from_secs(10));
    assert!(
        AcceptanceCriteria::realtime().check(stats.dispatch.p99_us, stats.queue.dropped),
        "p99={:?}us dropped={}",
        stats.dispatch.p99_us,
        stats.queue.dropped
    );
}
