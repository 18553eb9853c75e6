//! Time Manager daemon entry point.
//!
//! Runs a manager on the hardware counter with the hosted timer interrupt
//! thread, schedules a synthetic periodic workload, and drains the deferred
//! queue from the main loop until a signal or the run duration ends.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_common::config::TimeManagerConfig;
use tm_common::state::ManagerState;
use tm_runtime::{IsrTicker, TaskHandle, TimeManager};
use tracing::{debug, error, info, warn};

use crate::diagnostics::{format_prometheus_metrics, snapshot, DiagnosticsState};
use crate::signals::SignalHandler;

/// Time Manager daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "tmd",
    about = "Time Manager daemon - deadline scheduler with a hosted timer interrupt",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this long (e.g. "10s"); runs until signalled otherwise.
    #[arg(long, short = 'd', value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Number of synthetic periodic tasks.
    #[arg(long, short = 't', default_value = "4")]
    tasks: usize,

    /// Period of the synthetic tasks (e.g. "1ms").
    #[arg(long, short = 'p', default_value = "1ms", value_parser = humantime::parse_duration)]
    period: Duration,

    /// Interval between status reports.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    report_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Print the final diagnostics snapshot as JSON.
    #[arg(long)]
    json: bool,

    /// Print the final diagnostics in Prometheus text format.
    #[arg(long)]
    prometheus: bool,
}

/// Synthetic workload parameters.
#[derive(Debug, Clone, Copy)]
struct Workload {
    tasks: usize,
    period_us: u64,
}

/// A started manager with its timer thread and workload.
struct Runtime {
    manager: Arc<TimeManager>,
    ticker: Option<IsrTicker>,
    tasks: Vec<TaskHandle>,
}

impl Runtime {
    fn start(
        config: TimeManagerConfig,
        workload: Workload,
        diagnostics: &Arc<DiagnosticsState>,
    ) -> Result<Self> {
        let isr_thread = config.isr_thread.clone();
        let manager = Arc::new(TimeManager::new(config).context("Failed to start time manager")?);

        let tasks = (0..workload.tasks)
            .map(|index| {
                let diagnostics = Arc::clone(diagnostics);
                TaskHandle::named(&format!("synthetic-{index}"), true, move |_| {
                    diagnostics.record_callback();
                })
            })
            .collect::<Vec<_>>();
        for task in &tasks {
            manager
                .insert(task)
                .with_context(|| format!("Failed to insert task {}", task.name()))?;
            manager
                .prime(task, workload.period_us)
                .with_context(|| format!("Failed to prime task {}", task.name()))?;
        }

        let ticker = if isr_thread.enabled {
            Some(IsrTicker::start(Arc::clone(&manager), &isr_thread).context("Failed to start timer thread")?)
        } else {
            warn!("Hosted timer thread disabled; deadlines are only serviced from the main loop");
            None
        };

        info!(
            tasks = tasks.len(),
            period_us = workload.period_us,
            "Synthetic workload scheduled"
        );
        Ok(Self {
            manager,
            ticker,
            tasks,
        })
    }

    fn stop(mut self) {
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        for task in &self.tasks {
            if let Err(e) = self.manager.remove(task) {
                debug!(task = task.name(), error = %e, "Task already removed");
            }
        }
        self.manager.shutdown();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Time Manager daemon");

    let config = load_config(args.config.as_ref())?;
    info!(
        task_capacity = config.task_capacity,
        catch_up_limit = config.catch_up_limit,
        method = %config.calibration.method,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;
    let diagnostics = Arc::new(DiagnosticsState::new());

    run_daemon(&args, config, &signal_handler, &diagnostics)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("tmd={level},tm_runtime={level},tm_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TM_CONFIG_PATH` environment variable
/// 3. `/etc/time-manager/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(cli_path: Option<&PathBuf>) -> Result<TimeManagerConfig> {
    if let Some(config_path) = cli_path {
        info!(?config_path, "Loading config from command-line argument");
        return TimeManagerConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("TM_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TM_CONFIG_PATH");
            return TimeManagerConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from TM_CONFIG_PATH={env_path:?}"));
        }
        warn!(
            path = %env_path,
            "TM_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/time-manager/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return TimeManagerConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(TimeManagerConfig::default())
}

/// Main daemon loop.
fn run_daemon(
    args: &Args,
    mut config: TimeManagerConfig,
    signal_handler: &SignalHandler,
    diagnostics: &Arc<DiagnosticsState>,
) -> Result<()> {
    let workload = Workload {
        tasks: args.tasks,
        period_us: u64::try_from(args.period.as_micros()).unwrap_or(u64::MAX).max(1),
    };
    if workload.tasks > config.task_capacity {
        anyhow::bail!(
            "{} synthetic tasks exceed task_capacity {}",
            workload.tasks,
            config.task_capacity
        );
    }

    let mut runtime = Runtime::start(config.clone(), workload, diagnostics)?;
    info!(info = ?runtime.manager.time_base_info(), "Entering main loop");

    let started = Instant::now();
    let mut last_report = Instant::now();
    let idle = Duration::from_micros(500);

    while !signal_handler.shutdown_requested() {
        if signal_handler.take_reload_request() {
            match reload(args.config.as_ref(), &config) {
                Ok(Some(new_config)) => {
                    info!("Configuration changed, restarting time manager");
                    runtime.stop();
                    runtime = Runtime::start(new_config.clone(), workload, diagnostics)?;
                    config = new_config;
                }
                Ok(None) => info!("Configuration unchanged"),
                Err(e) => error!(error = %format!("{e:#}"), "Reload failed, keeping current configuration"),
            }
        }

        if runtime.ticker.is_none() {
            runtime.manager.poll_timer();
        }
        let report = runtime.manager.drain_with_default_budget();
        if report.dequeued == 0 {
            std::thread::sleep(idle);
        }

        if last_report.elapsed() >= args.report_interval {
            last_report = Instant::now();
            let snap = snapshot(&runtime.manager, ManagerState::Running, diagnostics);
            info!(
                health = %snap.health,
                callbacks = snap.workload_callbacks,
                interrupts = snap.isr.interrupts,
                dropped = snap.drain.queue.dropped,
                late = snap.drain.dispatch.late_count,
                avg_lateness_us = snap.drain.dispatch.average_us,
                max_latency_us = snap.isr.max_latency_us,
                "Periodic status"
            );
        }

        if args.duration.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Run duration reached");
            signal_handler.request_shutdown();
        }
    }

    info!("Shutting down...");
    let manager = Arc::clone(&runtime.manager);
    runtime.stop();

    let snap = snapshot(&manager, ManagerState::Stopped, diagnostics);
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snap).context("Failed to serialize diagnostics")?
        );
    }
    if args.prometheus {
        print!("{}", format_prometheus_metrics(&snap));
    }
    info!(
        callbacks = snap.workload_callbacks,
        interrupts = snap.isr.interrupts,
        stale = snap.drain.stale,
        dropped = snap.drain.queue.dropped,
        signals = signal_handler.state().signal_count(),
        uptime_secs = snap.uptime.as_secs(),
        "Daemon shutdown complete"
    );

    Ok(())
}

/// Re-read the configuration; `Some` only if it changed.
fn reload(cli_path: Option<&PathBuf>, current: &TimeManagerConfig) -> Result<Option<TimeManagerConfig>> {
    let new_config = load_config(cli_path)?;
    new_config
        .validate()
        .context("Reloaded configuration is invalid")?;
    Ok((new_config != *current).then_some(new_config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["tmd"]);
        assert!(args.config.is_none());
        assert!(args.duration.is_none());
        assert_eq!(args.tasks, 4);
        assert_eq!(args.period, Duration::from_millis(1));
        assert!(!args.json);
    }

    #[test]
    fn test_args_with_durations() {
        let args = Args::parse_from([
            "tmd", "-c", "tm.toml", "-d", "10s", "-t", "8", "-p", "250us", "--json",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("tm.toml")));
        assert_eq!(args.duration, Some(Duration::from_secs(10)));
        assert_eq!(args.tasks, 8);
        assert_eq!(args.period, Duration::from_micros(250));
        assert!(args.json);
    }

    #[test]
    fn test_load_config_from_cli_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "task_capacity = 16\ncatch_up_limit = 2").unwrap();
        let path = file.path().to_path_buf();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.task_capacity, 16);
        assert_eq!(config.catch_up_limit, 2);

        assert!(reload(Some(&path), &config).unwrap().is_none());
        assert!(reload(Some(&path), &TimeManagerConfig::default())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let path = PathBuf::from("/nonexistent/tm.toml");
        assert!(load_config(Some(&path)).is_err());
    }
}
