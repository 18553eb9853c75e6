//! Configuration structures for the Time Manager.
//!
//! Every tuning constant of the scheduler core (catch-up cap, arm cap, drain
//! budget, calibration strategy) is a named, overridable field here. Supports
//! TOML deserialization with defaults matching the classic Time Manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level Time Manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeManagerConfig {
    /// Number of task table slots (N).
    pub task_capacity: usize,

    /// Deferred queue slots; rounded up to a power of two.
    pub deferred_capacity: usize,

    /// Catch-up cap C: missed periods a periodic task replays before its
    /// deadline resets to `now + period`.
    pub catch_up_limit: u32,

    /// Longest single hardware timer arm.
    #[serde(with = "humantime_serde")]
    pub max_arm: Duration,

    /// Default drain budget and dispatch metrics.
    pub drain: DrainConfig,

    /// Time base calibration.
    pub calibration: CalibrationConfig,

    /// Microsecond/nanosecond delay helpers.
    pub delay: DelayConfig,

    /// Hosted ISR driver thread.
    pub isr_thread: IsrThreadConfig,
}

impl Default for TimeManagerConfig {
    fn default() -> Self {
        Self {
            task_capacity: 64,
            deferred_capacity: 256,
            catch_up_limit: 4,
            max_arm: Duration::from_secs(1),
            drain: DrainConfig::default(),
            calibration: CalibrationConfig::default(),
            delay: DelayConfig::default(),
            isr_thread: IsrThreadConfig::default(),
        }
    }
}

/// Budget applied by a default drain pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Maximum callbacks per drain (0 = unlimited).
    pub max_tasks: usize,

    /// Maximum wall-clock time per drain (0 = unlimited).
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,

    /// Dispatch lateness beyond which a callback counts as late.
    #[serde(with = "humantime_serde")]
    pub late_threshold: Duration,

    /// Lateness samples kept for percentile reporting.
    pub histogram_size: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_tasks: 10,
            max_time: Duration::from_millis(5),
            late_threshold: Duration::from_millis(1),
            histogram_size: 1024,
        }
    }
}

/// Strategy used to determine the counter frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    /// Architected frequency if the counter reports one, otherwise `Reference`.
    #[default]
    Auto,
    /// Architected frequency only; falls back to the 1 MHz floor.
    Nominal,
    /// Measure against the OS monotonic clock over `window`.
    Reference,
    /// Spin a loop of assumed duration and count elapsed ticks.
    BusyLoop,
    /// Use `frequency_hz` verbatim.
    Fixed,
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Nominal => write!(f, "nominal"),
            Self::Reference => write!(f, "reference"),
            Self::BusyLoop => write!(f, "busy_loop"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

/// Time base calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Calibration strategy.
    pub method: CalibrationMethod,

    /// Measurement window for reference calibration.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Loop length for busy-loop calibration.
    pub busy_loop_iterations: u64,

    /// Assumed duration of one busy-loop iteration.
    #[serde(with = "humantime_serde")]
    pub assumed_iteration: Duration,

    /// Counter frequency for `fixed` calibration.
    pub frequency_hz: Option<u64>,

    /// Samples taken when measuring read overhead and resolution.
    pub overhead_samples: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::Auto,
            window: Duration::from_millis(10),
            busy_loop_iterations: 1_000_000,
            assumed_iteration: Duration::from_nanos(1),
            frequency_hz: None,
            overhead_samples: 1_000,
        }
    }
}

/// Delay helper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Delays shorter than this busy-wait; longer ones poll.
    #[serde(with = "humantime_serde")]
    pub busy_wait_threshold: Duration,

    /// Sleep slice used by the poll-based wait.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Longest delay accepted.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            busy_wait_threshold: Duration::from_millis(1),
            poll_interval: Duration::from_micros(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Hosted ISR driver thread settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsrThreadConfig {
    /// Start the driver thread with the process-wide manager.
    pub enabled: bool,

    /// Period between simulated timer interrupts.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Real-time scheduling for the driver thread.
    pub realtime: RealtimeConfig,
}

impl Default for IsrThreadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_micros(20),
            realtime: RealtimeConfig::default(),
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr" or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPU affinity for the thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            // One below the maximum so a supervising thread can still preempt
            priority: 98,
            cpu_affinity: CpuAffinity::None,
            lock_memory: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// CPU affinity for the timer thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// CPUs named by this affinity, empty for [`CpuAffinity::None`].
    #[must_use]
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            Self::None => Vec::new(),
            Self::Single(cpu) => vec![*cpu],
            Self::Set(cpus) => cpus.clone(),
        }
    }
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index out of range"))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index cannot be negative"))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

impl TimeManagerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check semantic constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_capacity == 0 {
            return Err(ConfigError::Invalid("task_capacity must be at least 1".into()));
        }
        if u32::try_from(self.task_capacity).is_err() {
            return Err(ConfigError::Invalid(format!(
                "task_capacity {} exceeds the slot index range",
                self.task_capacity
            )));
        }
        if self.deferred_capacity == 0 {
            return Err(ConfigError::Invalid(
                "deferred_capacity must be at least 1".into(),
            ));
        }
        if self.deferred_capacity.checked_next_power_of_two().is_none() {
            return Err(ConfigError::Invalid(format!(
                "deferred_capacity {} is too large",
                self.deferred_capacity
            )));
        }
        if self.catch_up_limit == 0 {
            return Err(ConfigError::Invalid("catch_up_limit must be at least 1".into()));
        }
        if self.max_arm.is_zero() {
            return Err(ConfigError::Invalid("max_arm must be non-zero".into()));
        }
        if self.isr_thread.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "isr_thread.interval must be non-zero".into(),
            ));
        }
        if self.calibration.method == CalibrationMethod::Fixed
            && self.calibration.frequency_hz.unwrap_or(0) == 0
        {
            return Err(ConfigError::Invalid(
                "calibration.frequency_hz is required for fixed calibration".into(),
            ));
        }
        Ok(())
    }

    /// Deferred queue capacity after rounding up to a power of two.
    #[must_use]
    pub fn effective_deferred_capacity(&self) -> usize {
        let rounded = self
            .deferred_capacity
            .max(1)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX / 2 + 1);
        if rounded != self.deferred_capacity {
            tracing::debug!(
                requested = self.deferred_capacity,
                effective = rounded,
                "Deferred capacity rounded up to a power of two"
            );
        }
        rounded
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds a value the runtime cannot use.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
