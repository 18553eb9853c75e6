//! Process-wide Time Manager.
//!
//! Collaborators that cannot thread a [`TimeManager`] through their call
//! graph use these free functions. The instance runs on the hardware counter
//! with a polled timer, driven by an [`IsrTicker`] when
//! `isr_thread.enabled` is set.

use crate::interrupt::IsrStats;
use crate::manager::{DrainReport, DrainStats, TimeManager};
use crate::scheduler::ExpiryPass;
use crate::task::TaskHandle;
use crate::ticker::IsrTicker;
use crate::timebase::TimeBaseInfo;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tm_common::config::TimeManagerConfig;
use tm_common::error::{TmError, TmResult};
use tm_common::state::ManagerState;
use tm_common::time::UnsignedWide;
use tracing::info;

struct Global {
    state: ManagerState,
    manager: Option<Arc<TimeManager>>,
    ticker: Option<IsrTicker>,
}

static GLOBAL: Mutex<Global> = Mutex::new(Global {
    state: ManagerState::Uninitialized,
    manager: None,
    ticker: None,
});

fn global() -> MutexGuard<'static, Global> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Calibrate the time base, create the deferred queue and task table, and
/// start the hosted timer thread if configured.
///
/// # Errors
///
/// [`TmError::AlreadyInitialized`] while running, [`TmError::Config`] for
/// an invalid configuration or a failed thread spawn.
pub fn init_time_manager(config: TimeManagerConfig) -> TmResult<()> {
    let mut global = global();
    if global.state.is_active() {
        return Err(TmError::AlreadyInitialized);
    }
    if !global.state.can_transition_to(ManagerState::Running) {
        return Err(TmError::InvalidStateTransition {
            from: global.state.to_string(),
            to: ManagerState::Running.to_string(),
        });
    }

    let isr_thread = config.isr_thread.clone();
    let manager = Arc::new(TimeManager::new(config)?);
    let ticker = if isr_thread.enabled {
        Some(IsrTicker::start(Arc::clone(&manager), &isr_thread)?)
    } else {
        None
    };

    global.state.transition_to(ManagerState::Running)?;
    global.manager = Some(manager);
    global.ticker = ticker;
    info!(state = %global.state, "Process-wide time manager started");
    Ok(())
}

/// Stop the timer thread and tear down in reverse order.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn shutdown_time_manager() -> TmResult<()> {
    let mut global = global();
    if !global.state.is_active() {
        return Err(TmError::NotInitialized);
    }
    global.state.transition_to(ManagerState::ShuttingDown)?;

    if let Some(mut ticker) = global.ticker.take() {
        ticker.stop();
    }
    if let Some(manager) = global.manager.take() {
        manager.shutdown();
    }

    global.state.transition_to(ManagerState::Stopped)?;
    info!(state = %global.state, "Process-wide time manager stopped");
    Ok(())
}

/// Current lifecycle state.
pub fn manager_state() -> ManagerState {
    global().state
}

/// The running instance.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn time_manager() -> TmResult<Arc<TimeManager>> {
    let global = global();
    match (&global.manager, global.state.is_active()) {
        (Some(manager), true) => Ok(Arc::clone(manager)),
        _ => Err(TmError::NotInitialized),
    }
}

/// Register `task`. See [`TimeManager::insert`].
///
/// # Errors
///
/// [`TmError::NotInitialized`] or any error of [`TimeManager::insert`].
pub fn insert(task: &TaskHandle) -> TmResult<()> {
    time_manager()?.insert(task)
}

/// Unregister `task`. See [`TimeManager::remove`].
///
/// # Errors
///
/// [`TmError::NotInitialized`] or [`TmError::NotActive`].
pub fn remove(task: &TaskHandle) -> TmResult<u64> {
    time_manager()?.remove(task)
}

/// Arm `task`. See [`TimeManager::prime`].
///
/// # Errors
///
/// [`TmError::NotInitialized`] or [`TmError::NotActive`].
pub fn prime(task: &TaskHandle, delay_us: u64) -> TmResult<()> {
    time_manager()?.prime(task, delay_us)
}

/// Arm `task` with a classic count. See [`TimeManager::prime_count`].
///
/// # Errors
///
/// [`TmError::NotInitialized`] or [`TmError::NotActive`].
pub fn prime_count(task: &TaskHandle, count: i32) -> TmResult<()> {
    time_manager()?.prime_count(task, count)
}

/// Cancel `task`. See [`TimeManager::cancel`].
///
/// # Errors
///
/// [`TmError::NotInitialized`] or [`TmError::NotActive`].
pub fn cancel(task: &TaskHandle) -> TmResult<()> {
    time_manager()?.cancel(task)
}

/// Microseconds since boot; 0 before initialization.
pub fn now_micros() -> u64 {
    time_manager().map_or(0, |m| m.now_micros())
}

/// Microseconds since boot as a wide value.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn microseconds() -> TmResult<UnsignedWide> {
    Ok(time_manager()?.microseconds())
}

/// Calibration summary.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn time_base_info() -> TmResult<TimeBaseInfo> {
    Ok(time_manager()?.time_base_info())
}

/// Timer interrupt entry for an external driver.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn timer_isr() -> TmResult<Option<ExpiryPass>> {
    Ok(time_manager()?.timer_isr())
}

/// Run deferred callbacks. See [`TimeManager::drain_deferred`].
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn drain_deferred(max_tasks: usize, max_micros: u64) -> TmResult<DrainReport> {
    Ok(time_manager()?.drain_deferred(max_tasks, max_micros))
}

/// Wait at least `micros`.
///
/// # Errors
///
/// [`TmError::NotInitialized`] or [`TmError::Param`] above the limit.
pub fn delay_micros(micros: u64) -> TmResult<u64> {
    time_manager()?.delay_micros(micros)
}

/// Wait at least `nanos`.
///
/// # Errors
///
/// [`TmError::NotInitialized`] or [`TmError::Param`] above the limit.
pub fn delay_nanos(nanos: u64) -> TmResult<u64> {
    time_manager()?.delay_nanos(nanos)
}

/// Interrupt counters.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn isr_stats() -> TmResult<IsrStats> {
    Ok(time_manager()?.isr_stats())
}

/// Drain counters.
///
/// # Errors
///
/// [`TmError::NotInitialized`] if the manager is not running.
pub fn drain_stats() -> TmResult<DrainStats> {
    Ok(time_manager()?.drain_stats())
}
