//! The Time Manager: time base, task table, interrupt glue and deferred
//! dispatch composed behind one handle.
//!
//! Two execution contexts share a manager:
//!
//! - interrupt context ([`TimeManager::timer_isr`]) pops due tasks and
//!   publishes tickets to the deferred queue;
//! - mainline context inserts, primes and cancels tasks and calls
//!   [`TimeManager::drain_deferred`], which runs callbacks.
//!
//! Every access to the task table happens inside an [`InterruptGuard`] and
//! under the table lock. Callbacks run with neither held, so they may call
//! back into the manager.

use crate::clock::{HardwareClock, MonotonicClock};
use crate::deferred::{DeferredQueue, QueueStats};
use crate::delay;
use crate::guard::{DefaultInterrupts, InterruptGuard};
use crate::interrupt::{InterruptProgrammer, IsrStats, PolledTimer, TimerCore, TimerHardware};
use crate::scheduler::{ExpiryPass, Scheduler, TaskId, Ticket};
use crate::task::{Expiry, TaskHandle};
use crate::timebase::{TimeBase, TimeBaseInfo};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tm_common::config::TimeManagerConfig;
use tm_common::error::{TmError, TmResult};
use tm_common::metrics::{DispatchMetrics, DispatchSnapshot};
use tm_common::time::{count_to_micros, micros_to_ticks, sub_wide, UnsignedWide};
use tracing::{debug, info, warn};

/// Outcome of one drain call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Tickets taken off the queue.
    pub dequeued: usize,
    /// Callbacks run.
    pub executed: usize,
    /// Tickets skipped because their task was cancelled or re-primed.
    pub stale: usize,
    /// Tickets left queued.
    pub remaining: usize,
    /// Whether a budget ended the drain before the queue emptied.
    pub budget_exhausted: bool,
}

/// Cumulative drain counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    /// Drain calls that ran.
    pub drains: u64,
    /// Callbacks run.
    pub executed: u64,
    /// Stale tickets skipped.
    pub stale: u64,
    /// Deferred queue counters.
    pub queue: QueueStats,
    /// Dispatch lateness.
    pub dispatch: DispatchSnapshot,
}

#[derive(Debug)]
struct DrainState {
    metrics: DispatchMetrics,
    drains: u64,
    executed: u64,
    stale: u64,
    reported_drops: u64,
}

/// Clears the drain flag on every exit path.
struct DrainPass<'a>(&'a AtomicBool);

impl Drop for DrainPass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A running Time Manager instance.
pub struct TimeManager<C: MonotonicClock = HardwareClock, H: TimerHardware = PolledTimer> {
    config: TimeManagerConfig,
    time_base: TimeBase<C>,
    deferred: DeferredQueue,
    core: Mutex<TimerCore<H>>,
    /// Handle per slot; kept after a one-shot fire until the slot is reused.
    registry: Mutex<Box<[Option<TaskHandle>]>>,
    drain: Mutex<DrainState>,
    draining: AtomicBool,
}

impl TimeManager {
    /// Manager on the hardware counter with a polled timer.
    ///
    /// # Errors
    ///
    /// [`TmError::Config`] if the configuration is invalid.
    pub fn new(config: TimeManagerConfig) -> TmResult<Self> {
        Self::with_parts(config, HardwareClock, PolledTimer::default())
    }
}

impl<C: MonotonicClock> TimeManager<C> {
    /// Manager on `clock` with a polled timer.
    ///
    /// # Errors
    ///
    /// [`TmError::Config`] if the configuration is invalid.
    pub fn with_clock(config: TimeManagerConfig, clock: C) -> TmResult<Self> {
        Self::with_parts(config, clock, PolledTimer::default())
    }
}

impl<C: MonotonicClock, H: TimerHardware> TimeManager<C, H> {
    /// Manager on `clock` driving `hardware`.
    ///
    /// Initializes the time base, then the deferred queue, then the task
    /// table.
    ///
    /// # Errors
    ///
    /// [`TmError::Config`] if the configuration is invalid.
    pub fn with_parts(config: TimeManagerConfig, clock: C, hardware: H) -> TmResult<Self> {
        config
            .validate()
            .map_err(|e| TmError::Config(e.to_string()))?;

        let time_base = TimeBase::new(clock, &config.calibration);
        let deferred = DeferredQueue::new(config.effective_deferred_capacity());
        let scheduler = Scheduler::new(config.task_capacity, config.catch_up_limit)?;
        let max_arm_us = u64::try_from(config.max_arm.as_micros()).unwrap_or(u64::MAX);
        let programmer = InterruptProgrammer::new(hardware, time_base.resolution_us(), max_arm_us);

        let late_threshold_us =
            u64::try_from(config.drain.late_threshold.as_micros()).unwrap_or(u64::MAX);
        let drain = DrainState {
            metrics: DispatchMetrics::new(config.drain.histogram_size, late_threshold_us),
            drains: 0,
            executed: 0,
            stale: 0,
            reported_drops: 0,
        };

        info!(
            task_capacity = config.task_capacity,
            deferred_capacity = deferred.capacity(),
            catch_up_limit = config.catch_up_limit,
            max_arm_us,
            "Time manager initialized"
        );

        Ok(Self {
            registry: Mutex::new(vec![None; config.task_capacity].into_boxed_slice()),
            config,
            time_base,
            deferred,
            core: Mutex::new(TimerCore::new(scheduler, programmer)),
            drain: Mutex::new(drain),
            draining: AtomicBool::new(false),
        })
    }

    /// Run `f` on the task table with the timer interrupt masked.
    fn with_core<R>(&self, f: impl FnOnce(&mut TimerCore<H>) -> R) -> R {
        let _mask = InterruptGuard::<DefaultInterrupts>::new();
        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut core)
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut [Option<TaskHandle>]) -> R) -> R {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut registry)
    }

    /// Active configuration.
    pub fn config(&self) -> &TimeManagerConfig {
        &self.config
    }

    /// The calibrated time base.
    pub fn time_base(&self) -> &TimeBase<C> {
        &self.time_base
    }

    /// Register `task`, unarmed.
    ///
    /// # Errors
    ///
    /// [`TmError::Param`] if the task is already registered,
    /// [`TmError::QueueFull`] when every slot is taken.
    pub fn insert(&self, task: &TaskHandle) -> TmResult<()> {
        let ticket = self.with_core(|core| {
            let ticket = core.scheduler_mut().insert(task.id(), task.is_periodic())?;
            self.with_registry(|registry| {
                registry[ticket.slot() as usize] = Some(task.clone());
            });
            Ok::<_, TmError>(ticket)
        })?;
        debug!(task = %task.id(), %ticket, periodic = task.is_periodic(), "Task inserted");
        Ok(())
    }

    /// Arm `task` to fire `delay_us` from now.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is not registered.
    pub fn prime(&self, task: &TaskHandle, delay_us: u64) -> TmResult<()> {
        let ticket = self.with_core(|core| {
            let now = self.time_base.now_micros();
            let ticket = core.scheduler_mut().prime(task.id(), delay_us, now)?;
            core.reprogram(now);
            Ok::<_, TmError>(ticket)
        })?;
        debug!(task = %task.id(), %ticket, delay_us, "Task primed");
        Ok(())
    }

    /// Arm `task` with a classic count: positive milliseconds, negative
    /// microseconds.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is not registered.
    pub fn prime_count(&self, task: &TaskHandle, count: i32) -> TmResult<()> {
        self.prime(task, count_to_micros(count))
    }

    /// Disarm and unregister `task`, returning the microseconds that were
    /// left before it would have fired.
    ///
    /// A fire that is already queued for the task is discarded at drain. A
    /// one-shot that fired but was not yet drained reports 0.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is neither registered nor waiting
    /// on a queued fire.
    pub fn remove(&self, task: &TaskHandle) -> TmResult<u64> {
        let remaining = self.with_core(|core| {
            let now = self.time_base.now_micros();
            let scheduler = core.scheduler();
            let slot = scheduler
                .slot_of(task.id())
                .or_else(|| scheduler.retired_slot_of(task.id()));
            let remaining = core.scheduler_mut().remove(task.id(), now)?;
            if let Some(slot) = slot {
                self.with_registry(|registry| registry[slot] = None);
            }
            core.reprogram(now);
            Ok::<_, TmError>(remaining)
        })?;
        debug!(task = %task.id(), remaining_us = remaining, "Task removed");
        Ok(remaining)
    }

    /// Cancel `task`. Same effect as [`TimeManager::remove`].
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is neither registered nor waiting
    /// on a queued fire.
    pub fn cancel(&self, task: &TaskHandle) -> TmResult<()> {
        self.remove(task).map(|_| ())
    }

    /// Microseconds until `task` fires; 0 if due or unarmed.
    ///
    /// # Errors
    ///
    /// [`TmError::NotActive`] if the task is not registered.
    pub fn time_remaining(&self, task: &TaskHandle) -> TmResult<u64> {
        self.with_core(|core| {
            let now = self.time_base.now_micros();
            core.scheduler().time_remaining(task.id(), now)
        })
    }

    /// Whether `task` is registered.
    pub fn is_registered(&self, task: &TaskHandle) -> bool {
        self.with_core(|core| core.scheduler().slot_of(task.id()).is_some())
    }

    /// Timer interrupt entry. Expires due tasks if the armed time passed.
    pub fn timer_isr(&self) -> Option<ExpiryPass> {
        self.with_core(|core| {
            let now = self.time_base.now_micros();
            core.service(now, |ticket| self.deferred.enqueue(ticket))
        })
    }

    /// Polled-timer entry: runs the ISR only once the armed time has passed.
    pub fn poll_timer(&self) -> Option<ExpiryPass> {
        self.with_core(|core| {
            let now = self.time_base.now_micros();
            if core.is_due(now) {
                core.service(now, |ticket| self.deferred.enqueue(ticket))
            } else {
                None
            }
        })
    }

    /// Run deferred callbacks.
    ///
    /// Stops after `max_tasks` callbacks or `max_micros` of wall time,
    /// whichever comes first; 0 disables a budget. A drain started from
    /// inside a callback returns immediately.
    pub fn drain_deferred(&self, max_tasks: usize, max_micros: u64) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }
        let _pass = DrainPass(&self.draining);

        let start = self.time_base.now_micros();
        let mut report = DrainReport::default();

        loop {
            if max_tasks > 0 && report.executed >= max_tasks {
                report.budget_exhausted = !self.deferred.is_empty();
                break;
            }
            if max_micros > 0 && self.time_base.now_micros().saturating_sub(start) >= max_micros {
                report.budget_exhausted = !self.deferred.is_empty();
                break;
            }
            let Some(ticket) = self.deferred.dequeue() else {
                break;
            };
            report.dequeued += 1;

            let Some((task, deadline_us)) = self.claim(ticket) else {
                report.stale += 1;
                continue;
            };

            let expiry = Expiry {
                task,
                ticket,
                deadline_us,
                dispatched_at_us: self.time_base.now_micros(),
            };
            expiry.task.invoke(&expiry);
            report.executed += 1;

            let mut state = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
            state.metrics.record(expiry.lateness_us());
        }

        report.remaining = self.deferred.len();
        self.finish_drain(&report);
        report
    }

    /// Drain with the configured budgets.
    pub fn drain_with_default_budget(&self) -> DrainReport {
        let max_micros = u64::try_from(self.config.drain.max_time.as_micros()).unwrap_or(u64::MAX);
        self.drain_deferred(self.config.drain.max_tasks, max_micros)
    }

    /// Generation-check a dequeued ticket and fetch its handle.
    fn claim(&self, ticket: Ticket) -> Option<(TaskHandle, u64)> {
        self.with_core(|core| {
            let deadline = core.scheduler_mut().claim(ticket)?;
            let task = self.with_registry(|registry| registry[ticket.slot() as usize].clone())?;
            Some((task, deadline))
        })
    }

    fn finish_drain(&self, report: &DrainReport) {
        let dropped = self.deferred.dropped();
        let mut state = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
        state.drains += 1;
        state.executed += report.executed as u64;
        state.stale += report.stale as u64;
        if dropped > state.reported_drops {
            warn!(
                dropped = dropped - state.reported_drops,
                capacity = self.deferred.capacity(),
                "Deferred queue overflowed since last drain"
            );
            state.reported_drops = dropped;
        }
    }

    /// Disarm every task and discard queued fires.
    ///
    /// Tears down in reverse order of construction: task table, then
    /// deferred queue.
    pub fn shutdown(&self) {
        self.with_core(|core| {
            core.scheduler_mut().clear();
            core.reprogram(self.time_base.now_micros());
            self.with_registry(|registry| registry.fill(None));
        });
        self.deferred.clear();
        info!("Time manager shut down");
    }

    /// Microseconds since boot.
    pub fn now_micros(&self) -> u64 {
        self.time_base.now_micros()
    }

    /// Microseconds since boot as a wide value.
    pub fn microseconds(&self) -> UnsignedWide {
        UnsignedWide::from_u64(self.now_micros())
    }

    /// 60 Hz ticks since boot.
    pub fn tick_count(&self) -> u64 {
        micros_to_ticks(self.now_micros())
    }

    /// Calibration summary.
    pub fn time_base_info(&self) -> TimeBaseInfo {
        self.time_base.info()
    }

    /// Armed tasks.
    pub fn active_task_count(&self) -> usize {
        self.with_core(|core| core.scheduler().active_count())
    }

    /// Registered tasks.
    pub fn registered_task_count(&self) -> usize {
        self.with_core(|core| core.scheduler().registered_count())
    }

    /// Earliest armed deadline, microseconds since boot.
    pub fn next_deadline(&self) -> Option<u64> {
        self.with_core(|core| core.scheduler().next_deadline())
    }

    /// Whether the heap ordering holds.
    pub fn heap_is_valid(&self) -> bool {
        self.with_core(|core| core.scheduler().heap_is_valid())
    }

    /// Interrupt counters.
    pub fn isr_stats(&self) -> IsrStats {
        self.with_core(|core| core.stats())
    }

    /// Deferred queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.deferred.stats()
    }

    /// Drain counters.
    pub fn drain_stats(&self) -> DrainStats {
        let state = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
        DrainStats {
            drains: state.drains,
            executed: state.executed,
            stale: state.stale,
            queue: self.deferred.stats(),
            dispatch: state.metrics.snapshot(),
        }
    }

    /// Wait at least `micros`.
    ///
    /// # Errors
    ///
    /// [`TmError::Param`] above the configured maximum delay.
    pub fn delay_micros(&self, micros: u64) -> TmResult<u64> {
        delay::delay_micros(&self.time_base, micros, &self.config.delay)
    }

    /// Wait at least `nanos`.
    ///
    /// # Errors
    ///
    /// [`TmError::Param`] above the configured maximum delay.
    pub fn delay_nanos(&self, nanos: u64) -> TmResult<u64> {
        delay::delay_nanos(&self.time_base, nanos, &self.config.delay)
    }

    /// Start a stopwatch.
    pub fn start_performance_timer(&self) -> UnsignedWide {
        self.microseconds()
    }

    /// Microseconds since `start`.
    ///
    /// # Errors
    ///
    /// [`TmError::Underflow`] if `start` lies in the future.
    pub fn end_performance_timer(&self, start: UnsignedWide) -> TmResult<u64> {
        sub_wide(self.microseconds(), start).map(UnsignedWide::to_u64)
    }

    /// Registered task ids, in slot order.
    pub fn registered_tasks(&self) -> Vec<TaskId> {
        self.with_core(|core| {
            (0..core.scheduler().capacity())
                .filter_map(|slot| core.scheduler().entry(slot).and_then(|e| e.owner()))
                .collect()
        })
    }
}

impl<C: MonotonicClock, H: TimerHardware> std::fmt::Debug for TimeManager<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeManager")
            .field("time_base", &self.time_base.info())
            .field("queue", &self.deferred.stats())
            .finish_non_exhaustive()
    }
}
