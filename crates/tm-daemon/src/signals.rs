//! Signal handling for graceful daemon shutdown.
//!
//! SIGTERM and SIGINT request shutdown, SIGHUP requests a configuration
//! reload. The handlers only store atomics; a watcher thread folds them into
//! the shared [`SignalState`] that the main loop polls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalKind {
    /// SIGTERM - graceful termination.
    Terminate = 1,
    /// SIGINT - Ctrl+C.
    Interrupt = 2,
    /// SIGHUP - reload configuration.
    Hangup = 3,
}

impl SignalKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Terminate),
            2 => Some(Self::Interrupt),
            3 => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// State shared between the signal watcher and the main loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Whether a reload was requested; clears the flag.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::AcqRel)
    }

    /// Request shutdown from any thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Request a reload from any thread.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
    }

    fn record_signal(&self) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Signals received so far, reported at shutdown.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Owner of the process signal handlers.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install handlers for SIGTERM, SIGINT and SIGHUP.
    ///
    /// # Errors
    ///
    /// Fails if a handler cannot be installed or the watcher thread cannot
    /// be spawned.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.register_unix_handlers()?;

        Ok(handler)
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn register_unix_handlers(&self) -> std::io::Result<()> {
        use std::os::raw::c_int;

        // Written from signal context, so only lock-free atomics.
        static PENDING: AtomicU32 = AtomicU32::new(0);
        static RELOAD: AtomicBool = AtomicBool::new(false);

        extern "C" fn on_terminate(signal: c_int) {
            let kind = if signal == libc::SIGINT {
                SignalKind::Interrupt
            } else {
                SignalKind::Terminate
            };
            PENDING.store(kind as u32, Ordering::Release);
        }

        extern "C" fn on_hangup(_: c_int) {
            RELOAD.store(true, Ordering::Release);
        }

        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("tm-signals".into())
            .spawn(move || loop {
                if let Some(kind) = SignalKind::from_raw(PENDING.swap(0, Ordering::AcqRel)) {
                    info!(signal = %kind, "Shutdown signal received");
                    state.record_signal();
                    state.request_shutdown();
                }
                if RELOAD.swap(false, Ordering::AcqRel) {
                    info!(signal = %SignalKind::Hangup, "Reload signal received");
                    state.record_signal();
                    state.request_reload();
                }
                if state.shutdown_requested() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            })?;

        let terminate = on_terminate as extern "C" fn(c_int) as libc::sighandler_t;
        let hangup = on_hangup as extern "C" fn(c_int) as libc::sighandler_t;
        for (signal, handler) in [
            (libc::SIGTERM, terminate),
            (libc::SIGINT, terminate),
            (libc::SIGHUP, hangup),
        ] {
            // SAFETY: the handlers only touch static atomics
            if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Whether a reload was requested; clears the flag.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.state.take_reload_request()
    }

    /// Request shutdown without a signal.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}
