//! Error types shared by every stage of a collection run.

use std::fmt;

use thiserror::Error;

/// Errors produced while configuring, running or persisting a collection.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A `CollectionOptions` field holds a value that can never be satisfied.
    #[error("invalid collection option `{field}`: {reason}")]
    InvalidOptions {
        field: &'static str,
        reason: String,
    },

    /// A task descriptor is internally inconsistent.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// The collector configuration is unusable.
    #[error("invalid collector configuration: {0}")]
    InvalidConfig(String),

    /// A strong id was requested from a task that has no decoder yet.
    #[error("task has no decoder assigned, so it has no strong id")]
    MissingDecoder,

    /// No sampler is registered under the requested decoder name.
    #[error("no sampler registered for decoder '{name}' (available: {available:?})")]
    UnknownDecoder {
        name: String,
        available: Vec<String>,
    },

    /// A sampler exists but cannot run in this environment.
    #[error("sampler '{name}' is unavailable: {remediation}")]
    Unavailable { name: String, remediation: String },

    /// A sampler reported a failure of its own.
    #[error("sampling failed: {0}")]
    Sampling(String),

    /// The store header does not match the required column set.
    #[error("unexpected store columns: expected {expected:?}, got {actual:?}")]
    StoreColumns {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// A store row could not be parsed.
    #[error("store parse error at line {line}: {message}")]
    StoreParse { line: usize, message: String },

    /// Two store entries share a strong id but disagree on an identity field.
    #[error("store entries for {strong_id} disagree on {field}")]
    StoreMismatch {
        strong_id: String,
        field: &'static str,
    },

    /// Merging an entry would overflow one of its counters.
    #[error("totals for {strong_id} overflow")]
    StoreOverflow { strong_id: String },

    /// A worker failed while running a job. Fatal to the whole run.
    #[error("Worker failed (worker {worker}): {failure}")]
    WorkerFailed {
        worker: usize,
        failure: WorkerFailure,
    },

    /// The result queue closed while jobs were still outstanding.
    #[error("worker pool disconnected with {outstanding} job(s) outstanding")]
    PoolDisconnected { outstanding: usize },

    /// Unfinished tasks remain but none of them can be handed a batch.
    #[error("collection stalled: {active} unfinished task(s) but no batch to hand out")]
    Stalled { active: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CollectError>;

/// Classification of a failure captured inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The sampler returned an error.
    Sampling,
    /// The sampler panicked.
    Panic,
    /// The job's decoder name did not resolve.
    UnknownDecoder,
    /// The sampler is missing an optional dependency or similar.
    Unavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Sampling => "sampling error",
            FailureKind::Panic => "panic",
            FailureKind::UnknownDecoder => "unknown decoder",
            FailureKind::Unavailable => "sampler unavailable",
        };
        f.write_str(s)
    }
}

/// Failure payload sent from a worker back to the driver.
///
/// Carries only owned strings so it can cross the worker boundary without
/// referencing anything the worker owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Captured backtrace or panic location, empty when unavailable.
    pub trace: String,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Classify an error returned by a sampler.
    pub fn from_error(err: &CollectError, trace: impl Into<String>) -> Self {
        let kind = match err {
            CollectError::UnknownDecoder { .. } => FailureKind::UnknownDecoder,
            CollectError::Unavailable { .. } => FailureKind::Unavailable,
            _ => FailureKind::Sampling,
        };
        Self::new(kind, err.to_string(), trace)
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}
