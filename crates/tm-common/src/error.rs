use thiserror::Error;

/// Time Manager error types covering task table, wide-time, and lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TmError {
    /// Invalid task handle or argument.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// Operation on a task that is not registered (never inserted or already removed).
    #[error("task is not active")]
    NotActive,

    /// Every slot of the task table is in use.
    #[error("task table full: all {capacity} slots in use")]
    QueueFull {
        /// Configured task table capacity.
        capacity: usize,
    },

    /// Wide-time addition exceeded 64 bits.
    #[error("wide time overflow")]
    Overflow,

    /// Wide-time subtraction went below zero.
    #[error("wide time underflow")]
    Underflow,

    /// The process-wide time manager has not been initialized.
    #[error("time manager not initialized")]
    NotInitialized,

    /// The process-wide time manager is already running.
    #[error("time manager already initialized")]
    AlreadyInitialized,

    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl TmError {
    /// Shorthand for a [`TmError::Param`] with a message.
    pub fn param(msg: impl Into<String>) -> Self {
        Self::Param(msg.into())
    }
}

/// Convenience type alias for Time Manager operations.
pub type TmResult<T> = Result<T, TmError>;
