//! Interrupt programming layer and ISR entry.
//!
//! [`InterruptProgrammer`] turns the scheduler's earliest deadline into a
//! hardware arm: already-due deadlines fire after one resolution unit, short
//! ones are raised to the resolution, and no single arm exceeds `max_arm`.
//! [`TimerCore`] pairs the programmer with the [`Scheduler`] and is the state
//! the interrupt mask protects.

use crate::scheduler::{ExpiryPass, Scheduler, Ticket};
use serde::Serialize;
use tm_common::metrics::ema_update;

/// One-shot hardware timer.
pub trait TimerHardware: Send {
    /// Fire once, `delay_us` from now.
    fn arm(&mut self, delay_us: u64);
    /// Cancel any pending fire.
    fn disarm(&mut self);
}

/// Hosted timer with no hardware behind it; a driver loop polls
/// [`TimerCore::is_due`] and calls the ISR.
#[derive(Debug, Default)]
pub struct PolledTimer {
    armed_delay: Option<u64>,
    arms: u64,
}

impl PolledTimer {
    /// Delay of the current arm.
    pub fn armed_delay(&self) -> Option<u64> {
        self.armed_delay
    }

    /// Number of arms issued.
    pub fn arm_count(&self) -> u64 {
        self.arms
    }
}

impl TimerHardware for PolledTimer {
    fn arm(&mut self, delay_us: u64) {
        self.armed_delay = Some(delay_us);
        self.arms += 1;
    }

    fn disarm(&mut self) {
        self.armed_delay = None;
    }
}

/// Outcome of programming the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arming {
    /// Nothing scheduled; the timer is off.
    Disarmed,
    /// Timer armed.
    Armed {
        /// Relative delay handed to the hardware.
        delay_us: u64,
        /// Absolute time the arm expires.
        fires_at: u64,
    },
}

/// Computes and applies hardware arms.
#[derive(Debug)]
pub struct InterruptProgrammer<H: TimerHardware = PolledTimer> {
    hardware: H,
    resolution_us: u64,
    max_arm_us: u64,
    fires_at: Option<u64>,
    resolution_clamps: u64,
    max_arm_clamps: u64,
}

impl<H: TimerHardware> InterruptProgrammer<H> {
    /// Programmer for `hardware` with the time base resolution and arm cap.
    pub fn new(hardware: H, resolution_us: u64, max_arm_us: u64) -> Self {
        let resolution_us = resolution_us.max(1);
        Self {
            hardware,
            resolution_us,
            max_arm_us: max_arm_us.max(resolution_us),
            fires_at: None,
            resolution_clamps: 0,
            max_arm_clamps: 0,
        }
    }

    /// Arm for `deadline`, or disarm when there is none.
    pub fn program(&mut self, deadline: Option<u64>, now: u64) -> Arming {
        let Some(deadline) = deadline else {
            self.hardware.disarm();
            self.fires_at = None;
            return Arming::Disarmed;
        };

        let mut delay_us = deadline.saturating_sub(now);
        if delay_us < self.resolution_us {
            delay_us = self.resolution_us;
            self.resolution_clamps += 1;
        }
        if delay_us > self.max_arm_us {
            delay_us = self.max_arm_us;
            self.max_arm_clamps += 1;
        }

        self.hardware.arm(delay_us);
        let fires_at = now.saturating_add(delay_us);
        self.fires_at = Some(fires_at);
        Arming::Armed { delay_us, fires_at }
    }

    /// Absolute time of the pending arm.
    pub fn fires_at(&self) -> Option<u64> {
        self.fires_at
    }

    /// Whether the pending arm has expired at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        self.fires_at.is_some_and(|at| now >= at)
    }

    /// Resolution applied to short arms.
    pub fn resolution_us(&self) -> u64 {
        self.resolution_us
    }

    /// Cap applied to long arms.
    pub fn max_arm_us(&self) -> u64 {
        self.max_arm_us
    }

    /// Hardware behind the programmer.
    pub fn hardware(&self) -> &H {
        &self.hardware
    }
}

/// ISR counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IsrStats {
    /// ISR invocations.
    pub interrupts: u64,
    /// Invocations before the armed deadline.
    pub spurious: u64,
    /// Expiry passes run.
    pub passes: u64,
    /// Entries expired.
    pub expired: u64,
    /// Tickets published to the deferred queue.
    pub published: u64,
    /// Tickets dropped on a full deferred queue.
    pub dropped: u64,
    /// Periodic entries rescheduled from now after falling behind.
    pub catch_up_clamps: u64,
    /// Arms raised to the resolution.
    pub resolution_clamps: u64,
    /// Arms cut to the cap.
    pub max_arm_clamps: u64,
    /// Moving average of service lateness against the armed time.
    pub avg_latency_us: u64,
    /// Worst service lateness.
    pub max_latency_us: u64,
}

/// Scheduler plus timer programming; the state shared with the ISR.
#[derive(Debug)]
pub struct TimerCore<H: TimerHardware = PolledTimer> {
    scheduler: Scheduler,
    programmer: InterruptProgrammer<H>,
    stats: IsrStats,
}

impl<H: TimerHardware> TimerCore<H> {
    /// Combine a scheduler with a programmer.
    pub fn new(scheduler: Scheduler, programmer: InterruptProgrammer<H>) -> Self {
        Self {
            scheduler,
            programmer,
            stats: IsrStats::default(),
        }
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The scheduler, mutably. Reprogram after changing deadlines.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// The programmer.
    pub fn programmer(&self) -> &InterruptProgrammer<H> {
        &self.programmer
    }

    /// Arm the timer for the earliest deadline.
    pub fn reprogram(&mut self, now: u64) -> Arming {
        let next = self.scheduler.next_deadline();
        self.programmer.program(next, now)
    }

    /// Whether the pending arm has expired.
    pub fn is_due(&self, now: u64) -> bool {
        self.programmer.is_due(now)
    }

    /// ISR body. Runs an expiry pass only if the armed time has passed,
    /// then rearms.
    pub fn service<F>(&mut self, now: u64, publish: F) -> Option<ExpiryPass>
    where
        F: FnMut(Ticket) -> bool,
    {
        self.stats.interrupts += 1;
        let Some(fires_at) = self.programmer.fires_at().filter(|&at| now >= at) else {
            self.stats.spurious += 1;
            return None;
        };

        let latency = now - fires_at;
        self.stats.avg_latency_us = ema_update(self.stats.avg_latency_us, latency);
        self.stats.max_latency_us = self.stats.max_latency_us.max(latency);

        let pass = self.scheduler.expire_due(now, publish);
        self.stats.passes += 1;
        self.stats.expired += u64::from(pass.expired);
        self.stats.published += u64::from(pass.published);
        self.stats.dropped += u64::from(pass.dropped);
        self.stats.catch_up_clamps += u64::from(pass.clamped);

        self.reprogram(now);
        Some(pass)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> IsrStats {
        IsrStats {
            resolution_clamps: self.programmer.resolution_clamps,
            max_arm_clamps: self.programmer.max_arm_clamps,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskId;

    fn programmer() -> InterruptProgrammer<PolledTimer> {
        InterruptProgrammer::new(PolledTimer::default(), 5, 1_000_000)
    }

    #[test]
    fn test_absent_deadline_disarms() {
        let mut p = programmer();
        p.program(Some(100), 0);
        assert_eq!(p.program(None, 10), Arming::Disarmed);
        assert_eq!(p.hardware().armed_delay(), None);
        assert!(!p.is_due(u64::MAX));
    }

    #[test]
    fn test_deadline_at_boot_is_armed() {
        let mut p = programmer();
        assert_eq!(
            p.program(Some(0), 0),
            Arming::Armed {
                delay_us: 5,
                fires_at: 5
            }
        );
        assert!(p.is_due(5));
    }

    #[test]
    fn test_past_deadline_arms_at_resolution() {
        let mut p = programmer();
        assert_eq!(
            p.program(Some(50), 80),
            Arming::Armed {
                delay_us: 5,
                fires_at: 85
            }
        );
    }

    #[test]
    fn test_short_delay_raised_to_resolution() {
        let mut p = programmer();
        let arming = p.program(Some(102), 100);
        assert_eq!(
            arming,
            Arming::Armed {
                delay_us: 5,
                fires_at: 105
            }
        );
    }

    #[test]
    fn test_long_delay_capped() {
        let mut p = programmer();
        let arming = p.program(Some(10_000_000), 0);
        assert_eq!(
            arming,
            Arming::Armed {
                delay_us: 1_000_000,
                fires_at: 1_000_000
            }
        );
        assert_eq!(p.hardware().armed_delay(), Some(1_000_000));
    }

    #[test]
    fn test_is_due() {
        let mut p = programmer();
        p.program(Some(200), 100);
        assert!(!p.is_due(199));
        assert!(p.is_due(200));
    }

    #[test]
    fn test_service_ignores_early_ticks() {
        let mut core = TimerCore::new(Scheduler::new(4, 4).unwrap(), programmer());
        core.scheduler_mut().insert(TaskId(1), false).unwrap();
        core.scheduler_mut().prime(TaskId(1), 100, 0).unwrap();
        core.reprogram(0);

        assert!(core.service(50, |_| true).is_none());
        let pass = core.service(120, |_| true).unwrap();
        assert_eq!(pass.expired, 1);

        let stats = core.stats();
        assert_eq!(stats.interrupts, 2);
        assert_eq!(stats.spurious, 1);
        assert_eq!(stats.max_latency_us, 20);
        assert_eq!(core.programmer().fires_at(), None);
    }

    #[test]
    fn test_zero_delay_at_boot_expires() {
        let mut core = TimerCore::new(Scheduler::new(4, 4).unwrap(), programmer());
        core.scheduler_mut().insert(TaskId(1), false).unwrap();
        core.scheduler_mut().prime(TaskId(1), 0, 0).unwrap();
        core.reprogram(0);

        assert!(core.is_due(5));
        assert_eq!(core.service(5, |_| true).unwrap().expired, 1);
        assert_eq!(core.scheduler().next_deadline(), None);
    }

    #[test]
    fn test_capped_arm_reprograms_without_expiring() {
        let p = InterruptProgrammer::new(PolledTimer::default(), 5, 1_000);
        let mut core = TimerCore::new(Scheduler::new(4, 4).unwrap(), p);
        core.scheduler_mut().insert(TaskId(1), false).unwrap();
        core.scheduler_mut().prime(TaskId(1), 2_500, 0).unwrap();
        core.reprogram(0);

        let pass = core.service(1_000, |_| true).unwrap();
        assert_eq!(pass.expired, 0);
        assert_eq!(core.programmer().fires_at(), Some(2_000));
        let pass = core.service(2_000, |_| true).unwrap();
        assert_eq!(pass.expired, 0);
        assert_eq!(core.programmer().fires_at(), Some(2_500));
        assert_eq!(core.service(2_500, |_| true).unwrap().expired, 1);
        assert_eq!(core.stats().max_arm_clamps, 2);
    }
}
