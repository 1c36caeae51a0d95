//! Error types for CADENCE operations

use crate::{Date, InstitutionId};
use thiserror::Error;

/// An obligation interval that cannot be evaluated.
///
/// Callers skip the offending record instead of treating it as zero.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("Interval start date is missing")]
    MissingStart,

    #[error("Unparseable {field} date: {value:?}")]
    Unparseable { field: String, value: String },

    #[error("Interval ends before it starts: {start} > {end}")]
    EndBeforeStart { start: Date, end: Date },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Computation for key {key} aborted: {reason}")]
    ComputeAborted { key: String, reason: String },
}

/// Failures reported by the counts repository collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Repository operation {operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Repository unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Institution not found: {institution_id}")]
    InstitutionNotFound { institution_id: InstitutionId },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to install tracing subscriber: {reason}")]
    SubscriberInit { reason: String },
}

/// Master error type for all CADENCE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CadenceError {
    #[error("Interval error: {0}")]
    Interval(#[from] IntervalError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Aggregate statistics could not be produced. Distinct from a legitimately
    /// empty (null) score: callers should present "stats unavailable, retry".
    #[error("Stats unavailable for {scope}: {reason}")]
    StatsUnavailable { scope: String, reason: String },
}

impl CadenceError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StatsUnavailable { .. } => true,
            Self::Repository(RepositoryError::Timeout { .. })
            | Self::Repository(RepositoryError::Unavailable { .. }) => true,
            Self::Cache(CacheError::ComputeAborted { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for CADENCE operations.
pub type CadenceResult<T> = Result<T, CadenceError>;

// =============================================================================
// TESTS
// =============================================================================
