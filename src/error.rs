use thiserror::Error;

/// Result type returned by userland task bodies.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// Construction-time error: the argument record of a task could not be
/// canonicalised.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("argument name '{0}' uses the reserved 'task_' prefix")]
    ReservedName(String),

    #[error("argument '{0}' declared twice")]
    DuplicateName(String),

    #[error("argument '{name}' is not representable: {reason}")]
    Unrepresentable { name: String, reason: String },

    #[error("integer {0} does not fit the canonical integer range")]
    IntegerRange(u64),

    #[error("non-finite float {0} cannot participate in a task identity")]
    NonFiniteFloat(f64),
}

/// The task graph contains a cycle. Reported before any dispatch.
#[derive(Debug, Error)]
#[error("task graph contains a cycle: {}", cycle.join(" -> "))]
pub struct GraphCycleError {
    /// The offending cycle, as `task_name(task_id)` labels.
    pub cycle: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// No complete entry for the key. Expected; triggers computation.
    #[error("cache miss for {task_name}({task_id})")]
    Miss { task_name: String, task_id: String },

    /// An entry exists but cannot be read back. Treated as a miss by the
    /// scheduler sweep and replaced on the next store.
    #[error("corrupt cache entry for {task_name}({task_id}): {reason}")]
    Corrupt {
        task_name: String,
        task_id: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cache store path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

impl CacheError {
    /// True for the two error kinds the engine recovers from locally.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss { .. } | CacheError::Corrupt { .. })
    }
}

/// A task body, its dispatch, or its persistence failed during a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("task {task_name}({task_id}) failed: {cause}")]
    TaskFailed {
        task_name: String,
        task_id: String,
        cause: anyhow::Error,
    },

    #[error("dispatch failed for {task_name}({task_id}): {reason}")]
    Dispatch {
        task_name: String,
        task_id: String,
        reason: String,
    },

    #[error("run interrupted; in-flight tasks were drained")]
    Interrupted,

    #[error(transparent)]
    Cycle(#[from] GraphCycleError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The engine was asked to do something that makes no sense.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("rate limit for '{0}' names a slot that no task in this graph occupies")]
    UnknownSlot(String),

    #[error("rate limit for '{0}' must be a positive integer")]
    ZeroLimit(String),

    #[error("prefix command for '{0}' is empty")]
    EmptyPrefix(String),

    #[error("prefix command for '{slot}' is malformed: {reason}")]
    BadPrefix { slot: String, reason: String },

    #[error("no task named '{0}' is registered")]
    UnknownTask(String),

    #[error("rebuilt task '{task_name}' has id {rebuilt}, expected {expected}")]
    IdentityMismatch {
        task_name: String,
        expected: String,
        rebuilt: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Umbrella error for the whole crate.
#[derive(Debug, Error)]
pub enum KarakuriError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Cycle(#[from] GraphCycleError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}
