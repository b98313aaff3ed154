//! Error handling for procman.
use thiserror::Error;

/// Errors surfaced by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error, surfaced verbatim.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error creating the database directory.
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding of an args/env/startup_order column failed.
    #[error("failed to encode column value: {0}")]
    Encode(#[from] serde_json::Error),

    /// The store has been closed; no further operations are possible.
    #[error("store is closed")]
    Closed,

    /// A row lookup by id came up empty.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind ("process", "group", "error").
        entity: &'static str,
        /// The id that was requested.
        id: String,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A recognized environment variable holds an unparseable value.
    #[error("invalid value for {variable}: {value}")]
    InvalidValue {
        /// The environment variable name.
        variable: &'static str,
        /// The offending value.
        value: String,
    },

    /// A numeric option falls outside its allowed range.
    #[error("{variable} must be within {min}..={max}, got {value}")]
    OutOfRange {
        /// The environment variable name.
        variable: &'static str,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
        /// The rejected value.
        value: i64,
    },
}

/// Errors surfaced by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The command path is not covered by the configured allowlist.
    #[error("command '{command}' is not allowed")]
    CommandNotAllowed {
        /// The rejected command path.
        command: String,
    },

    /// Starting one more process would exceed the configured capacity.
    #[error("process capacity exceeded (limit {limit})")]
    CapacityExceeded {
        /// The configured maximum.
        limit: usize,
    },

    /// The requested process id is unknown to the supervisor.
    #[error("process '{id}' not found")]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// A start was requested for an id that is already running.
    #[error("process '{id}' is already running")]
    AlreadyRunning {
        /// The conflicting id.
        id: String,
    },

    /// The child process could not be spawned.
    #[error("failed to spawn '{name}': {source}")]
    SpawnFailed {
        /// The process name that failed to start.
        name: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Store failure while persisting lifecycle state.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A shared lock was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::Poisoned(err.to_string())
    }
}

/// Errors surfaced by health probe execution.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe command exceeded its wall-clock budget.
    #[error("health probe timed out after {0} ms")]
    Timeout(u64),

    /// The probe produced more output than the configured cap.
    #[error("health probe output exceeded {0} bytes")]
    OutputTooLarge(usize),

    /// The probe command is not covered by the allowlist.
    #[error("probe command '{command}' is not allowed")]
    CommandNotAllowed {
        /// The rejected command path.
        command: String,
    },

    /// The probe command could not be executed.
    #[error("failed to execute probe: {0}")]
    Exec(#[from] std::io::Error),

    /// No probe registration exists for the process.
    #[error("no probe registered for process '{id}'")]
    NotRegistered {
        /// The requested process id.
        id: String,
    },

    /// The process to probe does not exist in the store.
    #[error("process '{id}' not found")]
    ProcessNotFound {
        /// The requested process id.
        id: String,
    },

    /// Store failure while persisting a probe outcome.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by group operations.
#[derive(Debug, Error)]
pub enum GroupError {
    /// The requested group id is unknown.
    #[error("group '{id}' not found")]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// The group still has member processes and cannot be deleted.
    #[error("group '{id}' is not empty")]
    NotEmpty {
        /// The group id.
        id: String,
    },

    /// The process to add or remove is unknown.
    #[error("process '{id}' not found")]
    ProcessNotFound {
        /// The requested process id.
        id: String,
    },

    /// Store failure while persisting group state.
    #[error(transparent)]
    Store(#[from] StoreError),
}
