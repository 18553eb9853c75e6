//! Real-time setup for the hosted timer interrupt thread.
//!
//! On Linux the ISR driver thread can be promoted to SCHED_FIFO/SCHED_RR,
//! pinned to CPUs, and have the process memory locked. Missing privileges
//! degrade to a warning; the thread keeps running at normal priority.

use serde::Serialize;
use tm_common::config::{CpuAffinity, RealtimeConfig, SchedPolicy};
use tm_common::error::{TmError, TmResult};
use tracing::{debug, info, warn};

/// What [`apply_realtime`] managed to configure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeStatus {
    /// Whether memory was locked.
    pub memory_locked: bool,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the calling thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply `config` to the calling thread.
///
/// # Errors
///
/// [`TmError::Config`] for failures other than missing privileges or an
/// invalid CPU index.
pub fn apply_realtime(config: &RealtimeConfig) -> TmResult<RealtimeStatus> {
    if !config.enabled {
        debug!("Real-time scheduling disabled for timer thread");
        return Ok(RealtimeStatus::default());
    }

    let memory_locked = config.lock_memory && lock_memory()?;
    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;
    let cpu_affinity = set_cpu_affinity(&config.cpu_affinity)?;

    let status = RealtimeStatus {
        memory_locked,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "Timer thread real-time setup complete");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> TmResult<bool> {
    use nix::errno::Errno;
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            debug!("Process memory locked");
            Ok(true)
        }
        Err(Errno::EPERM | Errno::ENOMEM) => {
            warn!("mlockall not permitted; timer thread may take page faults");
            Ok(false)
        }
        Err(e) => Err(TmError::Config(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> TmResult<bool> {
    warn!("Memory locking not available on this platform");
    Ok(false)
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> TmResult<(Option<SchedPolicy>, Option<u8>)> {
    let native = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let priority = priority.clamp(1, 99);
    let param = libc::sched_param {
        sched_priority: i32::from(priority),
    };
    // SAFETY: pid 0 is the calling thread and param is fully initialized
    let result = unsafe { libc::sched_setscheduler(0, native, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(?policy, priority, "No privilege for real-time policy (CAP_SYS_NICE)");
            return Ok((None, None));
        }
        return Err(TmError::Config(format!("sched_setscheduler failed: {err}")));
    }

    debug!(?policy, priority, "Timer thread scheduler set");
    Ok((Some(policy), Some(priority)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> TmResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: &CpuAffinity) -> TmResult<Option<Vec<usize>>> {
    use nix::errno::Errno;
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = affinity.cpus();
    if cpus.is_empty() {
        return Ok(None);
    }

    let mut set = CpuSet::new();
    for &cpu in &cpus {
        if let Err(e) = set.set(cpu) {
            warn!(cpu, error = %e, "CPU index out of range, affinity not applied");
            return Ok(None);
        }
    }

    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => {
            debug!(?cpus, "Timer thread pinned");
            Ok(Some(cpus))
        }
        Err(Errno::EINVAL) => {
            warn!(?cpus, "No online CPU in affinity set");
            Ok(None)
        }
        Err(e) => Err(TmError::Config(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(affinity: &CpuAffinity) -> TmResult<Option<Vec<usize>>> {
    if !affinity.cpus().is_empty() {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}
