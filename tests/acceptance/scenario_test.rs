//! Deterministic scheduling scenarios on a simulated counter.
//!
//! Every test drives the timer interrupt by hand in 1µs steps, so results
//! do not depend on host timing.

use super::common::{counting_task, fired, run_ticks, simulated_manager, XorShift};
use tm_common::config::TimeManagerConfig;
use tm_common::error::TmError;
use tm_runtime::TaskHandle;

#[test]
fn test_one_shot_fires_exactly_once() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (t1, count) = counting_task(false);
    manager.insert(&t1).unwrap();
    manager.prime(&t1, 1_000).unwrap();

    run_ticks(&manager, &clock, 999);
    assert_eq!(fired(&count), 0);

    run_ticks(&manager, &clock, 1);
    assert_eq!(fired(&count), 1);

    run_ticks(&manager, &clock, 5_000);
    assert_eq!(fired(&count), 1);
    assert_eq!(manager.active_task_count(), 0);
    assert!(!manager.is_registered(&t1));
}

#[test]
fn test_periodic_fires_every_period() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (t2, count) = counting_task(true);
    manager.insert(&t2).unwrap();
    manager.prime(&t2, 2_000).unwrap();

    run_ticks(&manager, &clock, 10_000);
    let fires = fired(&count);
    assert!((4..=6).contains(&fires), "fired {fires} times");
    assert_eq!(fires, 5);
    assert_eq!(manager.isr_stats().catch_up_clamps, 0);
    assert_eq!(manager.drain_stats().stale, 0);
}

#[test]
fn test_cancelled_task_never_fires() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (t3, count) = counting_task(false);
    manager.insert(&t3).unwrap();
    manager.prime(&t3, 5_000).unwrap();

    run_ticks(&manager, &clock, 2_000);
    manager.cancel(&t3).unwrap();
    run_ticks(&manager, &clock, 8_000);

    assert_eq!(fired(&count), 0);
    assert_eq!(manager.now_micros(), 10_000);
    assert_eq!(manager.isr_stats().expired, 0);
    assert!(!manager.is_registered(&t3));
}

#[test]
fn test_full_table_rejects_then_accepts_after_remove() {
    let config = TimeManagerConfig {
        task_capacity: 8,
        ..TimeManagerConfig::default()
    };
    let (manager, _clock) = simulated_manager(config);

    let tasks: Vec<TaskHandle> = (0..8).map(|_| TaskHandle::one_shot(|_| {})).collect();
    for task in &tasks {
        manager.insert(task).unwrap();
    }
    assert_eq!(manager.registered_task_count(), 8);

    let extra = TaskHandle::one_shot(|_| {});
    assert_eq!(manager.insert(&extra), Err(TmError::QueueFull { capacity: 8 }));

    manager.remove(&tasks[3]).unwrap();
    manager.insert(&extra).unwrap();
    assert_eq!(manager.registered_task_count(), 8);
}

#[test]
fn test_deferred_overflow_drains_only_valid_entries() {
    let config = TimeManagerConfig {
        task_capacity: 32,
        deferred_capacity: 4,
        ..TimeManagerConfig::default()
    };
    let (manager, clock) = simulated_manager(config);

    let tasks: Vec<_> = (0..32).map(|_| counting_task(false)).collect();
    for round in 0..3u64 {
        for (task, _) in &tasks {
            if !manager.is_registered(task) {
                manager.insert(task).unwrap();
            }
            manager.prime(task, 10).unwrap();
        }

        clock.advance_micros(10);
        let pass = manager.timer_isr().unwrap();
        assert_eq!(pass.expired, 32);
        assert_eq!(pass.published, 4);
        assert_eq!(pass.dropped, 28);

        let report = manager.drain_deferred(0, 0);
        assert_eq!(report.dequeued, 4);
        assert_eq!(report.executed, 4);
        assert_eq!(report.stale, 0);
        assert_eq!(report.remaining, 0);

        assert_eq!(manager.drain_deferred(0, 0).dequeued, 0);
        let total: u64 = tasks.iter().map(|(_, count)| fired(count)).sum();
        assert_eq!(total, 4 * (round + 1));
    }

    let stats = manager.queue_stats();
    assert_eq!(stats.capacity, 4);
    assert_eq!(stats.enqueued, 12);
    assert_eq!(stats.dropped, 84);
    assert!(stats.peak_depth <= 4);
}

#[test]
fn test_reprimed_periodic_discards_older_fire() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (task, count) = counting_task(true);
    manager.insert(&task).unwrap();
    manager.prime(&task, 100).unwrap();

    clock.advance_micros(100);
    manager.timer_isr();
    manager.prime(&task, 1_000).unwrap();

    let report = manager.drain_deferred(0, 0);
    assert_eq!(report.stale, 1);
    assert_eq!(report.executed, 0);
    assert_eq!(fired(&count), 0);
}

#[test]
fn test_zero_delay_at_boot_fires_once() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (task, count) = counting_task(false);
    let (later, later_count) = counting_task(false);
    manager.insert(&task).unwrap();
    manager.insert(&later).unwrap();
    assert_eq!(manager.now_micros(), 0);
    manager.prime(&task, 0).unwrap();
    manager.prime(&later, 500).unwrap();

    run_ticks(&manager, &clock, 100);
    assert_eq!(fired(&count), 1);
    assert_eq!(manager.next_deadline(), Some(500));

    run_ticks(&manager, &clock, 400);
    assert_eq!(fired(&count), 1);
    assert_eq!(fired(&later_count), 1);
    assert_eq!(manager.active_task_count(), 0);
}

#[test]
fn test_cancel_after_expiry_before_drain_skips_callback() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (task, count) = counting_task(false);
    manager.insert(&task).unwrap();
    manager.prime(&task, 100).unwrap();

    clock.advance_micros(100);
    assert_eq!(manager.timer_isr().unwrap().published, 1);
    manager.cancel(&task).unwrap();

    let report = manager.drain_deferred(0, 0);
    assert_eq!(report.executed, 0);
    assert_eq!(report.stale, 1);
    assert_eq!(fired(&count), 0);
    assert!(!manager.is_registered(&task));
}

#[test]
fn test_reinsert_after_expiry_before_drain_waits_for_new_deadline() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let (task, count) = counting_task(false);
    manager.insert(&task).unwrap();
    manager.prime(&task, 100).unwrap();

    clock.advance_micros(100);
    assert_eq!(manager.timer_isr().unwrap().published, 1);
    manager.insert(&task).unwrap();
    manager.prime(&task, 5_000).unwrap();

    let report = manager.drain_deferred(0, 0);
    assert_eq!((report.executed, report.stale), (0, 1));
    assert_eq!(fired(&count), 0);

    run_ticks(&manager, &clock, 4_999);
    assert_eq!(fired(&count), 0);
    run_ticks(&manager, &clock, 1);
    assert_eq!(fired(&count), 1);
    assert_eq!(manager.now_micros(), 5_100);
}

#[test]
fn test_catch_up_replays_at_most_limit_periods() {
    let config = TimeManagerConfig {
        catch_up_limit: 4,
        ..TimeManagerConfig::default()
    };
    let (manager, clock) = simulated_manager(config);
    let (task, count) = counting_task(true);
    manager.insert(&task).unwrap();
    manager.prime(&task, 100).unwrap();

    // Three periods behind: every missed period is replayed in one pass,
    // and only the newest fire survives to the drain.
    clock.advance_micros(450);
    let pass = manager.timer_isr().unwrap();
    assert_eq!(pass.expired, 4);
    assert_eq!(pass.clamped, 0);
    let report = manager.drain_deferred(0, 0);
    assert_eq!((report.executed, report.stale), (1, 3));
    assert_eq!(manager.next_deadline(), Some(500));

    // Far behind: one fire, then the deadline restarts from now.
    clock.advance_micros(10_000);
    let pass = manager.timer_isr().unwrap();
    assert_eq!(pass.expired, 1);
    assert_eq!(pass.clamped, 1);
    assert_eq!(manager.next_deadline(), Some(10_550));
    manager.drain_deferred(0, 0);
    assert_eq!(fired(&count), 2);
}

#[test]
fn test_catch_up_bound_holds_for_random_stalls() {
    let limit = 3;
    let config = TimeManagerConfig {
        catch_up_limit: limit,
        ..TimeManagerConfig::default()
    };
    let (manager, clock) = simulated_manager(config);
    let (task, _count) = counting_task(true);
    manager.insert(&task).unwrap();
    manager.prime(&task, 50).unwrap();

    let mut rng = XorShift::new(0xC0FFEE);
    for _ in 0..200 {
        clock.advance_micros(1 + rng.below(2_000));
        if let Some(pass) = manager.timer_isr() {
            assert!(pass.expired <= limit, "expired {} in one pass", pass.expired);
            assert!(manager.next_deadline().unwrap() > manager.now_micros());
        }
        manager.drain_deferred(0, 0);
    }
}

#[test]
fn test_heap_stays_valid_under_random_operations() {
    let config = TimeManagerConfig {
        task_capacity: 24,
        ..TimeManagerConfig::default()
    };
    let (manager, clock) = simulated_manager(config);
    let tasks: Vec<TaskHandle> = (0..24)
        .map(|i| {
            if i % 3 == 0 {
                TaskHandle::periodic(|_| {})
            } else {
                TaskHandle::one_shot(|_| {})
            }
        })
        .collect();

    let mut rng = XorShift::new(42);
    for _ in 0..5_000 {
        let task = &tasks[rng.below(tasks.len() as u64) as usize];
        match rng.below(6) {
            0 => {
                let _ = manager.insert(task);
            }
            1 | 2 => {
                let _ = manager.prime(task, 1 + rng.below(500));
            }
            3 => {
                let _ = manager.cancel(task);
            }
            4 => {
                let _ = manager.remove(task);
            }
            _ => {
                clock.advance_micros(rng.below(100));
                manager.timer_isr();
                manager.drain_deferred(0, 0);
            }
        }
        assert!(manager.heap_is_valid());
        assert!(manager.active_task_count() <= manager.registered_task_count());
    }
}

#[test]
fn test_callback_reprimes_itself() {
    use std::sync::{Arc, Mutex, Weak};
    use tm_runtime::SimulatedClock;

    type Manager = tm_runtime::TimeManager<SimulatedClock>;

    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let manager = Arc::new(manager);
    let weak: Weak<Manager> = Arc::downgrade(&manager);
    let deadlines = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&deadlines);
    let task = TaskHandle::one_shot(move |expiry| {
        seen.lock().unwrap().push(expiry.deadline_us);
        if let Some(manager) = weak.upgrade() {
            if !manager.is_registered(&expiry.task) {
                manager.insert(&expiry.task).unwrap();
            }
            manager.prime(&expiry.task, 250).unwrap();
        }
    });
    manager.insert(&task).unwrap();
    manager.prime(&task, 250).unwrap();

    run_ticks(&manager, &clock, 1_000);
    assert_eq!(*deadlines.lock().unwrap(), vec![250, 500, 750, 1_000]);
}

#[test]
fn test_remove_reports_remaining_time() {
    let (manager, clock) = simulated_manager(TimeManagerConfig::default());
    let task = TaskHandle::one_shot(|_| {});
    manager.insert(&task).unwrap();
    manager.prime(&task, 3_000).unwrap();

    clock.advance_micros(1_200);
    assert_eq!(manager.time_remaining(&task), Ok(1_800));
    assert_eq!(manager.remove(&task), Ok(1_800));
    assert_eq!(manager.remove(&task), Err(TmError::NotActive));
    assert_eq!(manager.prime(&task, 10), Err(TmError::NotActive));
}
