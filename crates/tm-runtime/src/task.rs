//! Caller-owned timer tasks.
//!
//! A [`TaskHandle`] pairs a unique [`TaskId`] with the closure to run when
//! the task fires. The manager only borrows the handle while the task is
//! registered; the caller keeps it and may re-insert it any number of times.

use crate::scheduler::{TaskId, Ticket};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Boxed task callback.
pub type TaskCallback = Box<dyn FnMut(&Expiry) + Send>;

/// Information passed to a firing task.
#[derive(Debug, Clone)]
pub struct Expiry {
    /// The task that fired.
    pub task: TaskHandle,
    /// Ticket the fire was published under.
    pub ticket: Ticket,
    /// Deadline the fire was due at, microseconds since boot.
    pub deadline_us: u64,
    /// Time the callback was dispatched, microseconds since boot.
    pub dispatched_at_us: u64,
}

impl Expiry {
    /// Dispatch delay behind the deadline.
    pub fn lateness_us(&self) -> u64 {
        self.dispatched_at_us.saturating_sub(self.deadline_us)
    }
}

struct TaskInner {
    id: TaskId,
    periodic: bool,
    name: String,
    callback: Mutex<TaskCallback>,
}

/// Shared handle to a timer task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    fn with_kind<F>(name: &str, periodic: bool, callback: F) -> Self
    where
        F: FnMut(&Expiry) + Send + 'static,
    {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(TaskInner {
                id,
                periodic,
                name: name.to_owned(),
                callback: Mutex::new(Box::new(callback)),
            }),
        }
    }

    /// Task that fires once per prime.
    pub fn one_shot<F>(callback: F) -> Self
    where
        F: FnMut(&Expiry) + Send + 'static,
    {
        Self::with_kind("", false, callback)
    }

    /// Task that re-arms itself every period.
    pub fn periodic<F>(callback: F) -> Self
    where
        F: FnMut(&Expiry) + Send + 'static,
    {
        Self::with_kind("", true, callback)
    }

    /// Named task, for logs and diagnostics.
    pub fn named<F>(name: &str, periodic: bool, callback: F) -> Self
    where
        F: FnMut(&Expiry) + Send + 'static,
    {
        Self::with_kind(name, periodic, callback)
    }

    /// Unique identity.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Whether the task re-arms on expiry.
    pub fn is_periodic(&self) -> bool {
        self.inner.periodic
    }

    /// Name given at construction, empty if none.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run the callback.
    pub(crate) fn invoke(&self, expiry: &Expiry) {
        let mut callback = self
            .inner
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        callback(expiry);
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("periodic", &self.inner.periodic)
            .finish_non_exhaustive()
    }
}
