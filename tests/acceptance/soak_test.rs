//! Soak (long-duration stability) tests.
//!
//! Churns one-shot and periodic tasks on the hardware counter under the
//! hosted timer thread and checks that the manager neither leaks slots nor
//! memory, and that the heap stays valid throughout.
//!
//! Set `TM_SOAK_SECS` to change the run length (default 60).

use super::common::{get_memory_usage, hardware_config, XorShift};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_runtime::{IsrTicker, TaskHandle, TimeManager};

fn soak_duration() -> Duration {
    std::env::var("TM_SOAK_SECS")
        .ok()
        .and_then(|secs| secs.parse().ok())
        .map_or(Duration::from_secs(60), Duration::from_secs)
}

#[test]
#[ignore = "Long-running"]
fn test_soak_task_churn() {
    let duration = soak_duration();
    let mut config = hardware_config(Duration::from_micros(20));
    config.task_capacity = 64;
    let isr_thread = config.isr_thread.clone();
    let manager = Arc::new(TimeManager::new(config).unwrap());

    let fired = Arc::new(AtomicU64::new(0));
    let periodic: Vec<_> = (0..8)
        .map(|_| {
            let fired = Arc::clone(&fired);
            TaskHandle::periodic(move |_| {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    for (i, task) in periodic.iter().enumerate() {
        manager.insert(task).unwrap();
        manager.prime(task, 500 * (i as u64 + 1)).unwrap();
    }

    let one_shots: Vec<_> = (0..48)
        .map(|_| {
            let fired = Arc::clone(&fired);
            TaskHandle::one_shot(move |_| {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    let mut ticker = IsrTicker::start(Arc::clone(&manager), &isr_thread).unwrap();
    let initial_memory = get_memory_usage();
    let mut peak_memory = initial_memory;
    let mut rng = XorShift::new(0x5EED);
    let start = Instant::now();
    let mut last_log = Instant::now();

    while start.elapsed() < duration {
        let task = &one_shots[rng.below(one_shots.len() as u64) as usize];
        if !manager.is_registered(task) {
            manager.insert(task).unwrap();
        }
        // The timer thread may fire the previous arming in between.
        let _ = manager.prime(task, 100 + rng.below(5_000));
        if rng.below(8) == 0 {
            let _ = manager.remove(task);
        }

        manager.drain_deferred(0, 0);
        assert!(manager.heap_is_valid());
        std::thread::sleep(Duration::from_micros(100));

        if last_log.elapsed() >= Duration::from_secs(10) {
            last_log = Instant::now();
            peak_memory = peak_memory.max(get_memory_usage());
            println!(
                "[{:>5}s] fired={} registered={} peak_rss={}KiB",
                start.elapsed().as_secs(),
                fired.load(Ordering::Relaxed),
                manager.registered_task_count(),
                peak_memory / 1024
            );
        }
    }

    ticker.stop();
    manager.drain_deferred(0, 0);
    for task in &one_shots {
        let _ = manager.remove(task);
    }

    assert_eq!(manager.registered_task_count(), periodic.len());
    assert_eq!(manager.active_task_count(), periodic.len());
    assert!(fired.load(Ordering::Relaxed) > 0);
    assert_eq!(manager.queue_stats().dropped, 0);

    let growth = get_memory_usage().saturating_sub(initial_memory);
    assert!(growth < 4 * 1024 * 1024, "RSS grew by {growth} bytes");
    manager.shutdown();
    assert_eq!(manager.registered_task_count(), 0);
}
