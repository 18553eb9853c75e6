//! Process-wide facade and configuration loading.
//!
//! Runs on the hardware counter with the hosted timer thread, so timing
//! assertions use generous bounds.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tm_common::config::{CalibrationMethod, TimeManagerConfig};
use tm_common::error::TmError;
use tm_common::state::ManagerState;
use tm_common::time::UnsignedWide;
use tm_runtime::TaskHandle;

// The facade is process-wide, so the whole lifecycle lives in one test.
#[test]
fn test_global_time_manager_lifecycle() {
    assert_eq!(tm_runtime::manager_state(), ManagerState::Uninitialized);
    assert_eq!(tm_runtime::now_micros(), 0);
    assert_eq!(tm_runtime::time_base_info(), Err(TmError::NotInitialized));

    let mut config = TimeManagerConfig::default();
    config.calibration.window = Duration::from_millis(5);
    config.isr_thread.interval = Duration::from_micros(50);
    tm_runtime::init_time_manager(config.clone()).unwrap();
    assert_eq!(tm_runtime::manager_state(), ManagerState::Running);

    let info = tm_runtime::time_base_info().unwrap();
    assert!(info.frequency_hz >= 1_000_000);
    assert!(info.resolution_ns >= 1);

    let before = tm_runtime::now_micros();
    let waited = tm_runtime::delay_micros(200).unwrap();
    assert!(waited >= 200);
    assert!(tm_runtime::now_micros() - before >= 200);
    assert!(matches!(
        tm_runtime::delay_micros(3_600_000_000),
        Err(TmError::Param(_))
    ));

    let fired = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&fired);
    let task = TaskHandle::one_shot(move |_| {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    tm_runtime::insert(&task).unwrap();
    tm_runtime::prime(&task, 1_000).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
        tm_runtime::drain_deferred(0, 0).unwrap();
        std::thread::sleep(Duration::from_micros(200));
    }
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert!(tm_runtime::isr_stats().unwrap().expired >= 1);
    assert_eq!(tm_runtime::drain_stats().unwrap().executed, 1);

    tm_runtime::shutdown_time_manager().unwrap();
    assert_eq!(tm_runtime::manager_state(), ManagerState::Stopped);
    assert_eq!(tm_runtime::insert(&task), Err(TmError::NotInitialized));

    tm_runtime::init_time_manager(config).unwrap();
    tm_runtime::shutdown_time_manager().unwrap();
}

#[test]
fn test_performance_stopwatch_on_hardware_counter() {
    let mut config = TimeManagerConfig::default();
    config.isr_thread.enabled = false;
    let manager = tm_runtime::TimeManager::new(config).unwrap();

    let start = manager.start_performance_timer();
    std::thread::sleep(Duration::from_millis(2));
    let elapsed = manager.end_performance_timer(start).unwrap();
    assert!(elapsed >= 1_500, "elapsed {elapsed}us");

    let future = UnsignedWide::from(u64::MAX);
    assert_eq!(manager.end_performance_timer(future), Err(TmError::Underflow));
}

#[test]
fn test_config_file_overrides_tunables() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
task_capacity = 12
deferred_capacity = 5
catch_up_limit = 2
max_arm = "250ms"

[calibration]
method = "fixed"
frequency_hz = 25000000

[isr_thread]
enabled = false
"#
    )
    .unwrap();

    let config = TimeManagerConfig::from_file(file.path()).unwrap();
    assert_eq!(config.catch_up_limit, 2);
    assert_eq!(config.max_arm, Duration::from_millis(250));
    assert_eq!(config.effective_deferred_capacity(), 8);

    let manager = tm_runtime::TimeManager::new(config).unwrap();
    let info = manager.time_base_info();
    assert_eq!(info.frequency_hz, 25_000_000);
    assert_eq!(info.method, CalibrationMethod::Fixed);
    assert_eq!(manager.queue_stats().capacity, 8);

    let tasks: Vec<_> = (0..12).map(|_| TaskHandle::one_shot(|_| {})).collect();
    for task in &tasks {
        manager.insert(task).unwrap();
    }
    assert_eq!(
        manager.insert(&TaskHandle::one_shot(|_| {})),
        Err(TmError::QueueFull { capacity: 12 })
    );
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = TimeManagerConfig {
        catch_up_limit: 0,
        ..TimeManagerConfig::default()
    };
    assert!(matches!(
        tm_runtime::TimeManager::new(config),
        Err(TmError::Config(_))
    ));
}
