//! Hosted timer interrupt driver.
//!
//! Without a hardware timer interrupt, a dedicated thread polls the
//! manager's armed time every `interval` and runs the ISR once it has
//! passed. The thread can be given real-time priority.

use crate::clock::MonotonicClock;
use crate::interrupt::TimerHardware;
use crate::manager::TimeManager;
use crate::realtime::apply_realtime;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tm_common::config::IsrThreadConfig;
use tm_common::error::{TmError, TmResult};
use tracing::{debug, info, warn};

/// Background thread standing in for the timer interrupt.
#[derive(Debug)]
pub struct IsrTicker {
    stop: Arc<AtomicBool>,
    polls: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl IsrTicker {
    /// Spawn the driver thread for `manager`.
    ///
    /// # Errors
    ///
    /// [`TmError::Config`] if the thread cannot be spawned.
    pub fn start<C, H>(manager: Arc<TimeManager<C, H>>, config: &IsrThreadConfig) -> TmResult<Self>
    where
        C: MonotonicClock + 'static,
        H: TimerHardware + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicU64::new(0));
        let interval = config.interval.max(Duration::from_micros(1));
        let realtime = config.realtime.clone();

        let handle = {
            let stop = Arc::clone(&stop);
            let polls = Arc::clone(&polls);
            thread::Builder::new()
                .name("tm-timer-isr".into())
                .spawn(move || {
                    if let Err(e) = apply_realtime(&realtime) {
                        warn!(error = %e, "Timer thread continues without real-time setup");
                    }
                    debug!(interval_us = interval.as_micros(), "Timer thread started");

                    while !stop.load(Ordering::Acquire) {
                        manager.poll_timer();
                        polls.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(interval);
                    }
                    debug!("Timer thread stopped");
                })
                .map_err(|e| TmError::Config(format!("Failed to spawn timer thread: {e}")))?
        };

        info!(interval_us = interval.as_micros(), "Hosted timer interrupt running");
        Ok(Self {
            stop,
            polls,
            handle: Some(handle),
            interval,
        })
    }

    /// Polls performed so far.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Polling period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop and join the thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("Timer thread panicked");
        }
    }
}

impl Drop for IsrTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
