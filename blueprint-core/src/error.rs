//! Error types for Blueprint cache operations

use std::time::Duration;
use thiserror::Error;

/// Failures talking to the query execution collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport failed for {query}: {reason}")]
    Transport { query: String, reason: String },

    #[error("Fetch for {query} timed out after {timeout:?}")]
    Timeout { query: String, timeout: Duration },

    #[error("Invalid response for {query}: {reason}")]
    InvalidResponse { query: String, reason: String },
}

/// Normalized store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entity not found: {key}")]
    EntityNotFound { key: String },

    #[error("No read policy for {typename}.{field}")]
    NoReadPolicy { typename: String, field: String },

    #[error("No cached result for query {query_key}")]
    QueryNotFound { query_key: String },

    #[error("Invalid entity key: {key}")]
    InvalidKey { key: String },
}

/// Memoization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoError {
    #[error("Memo key is not serializable: {reason}")]
    UnserializableKey { reason: String },
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

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Blueprint errors.
///
/// `Fetch` is a foreground failure returned to the caller. The
/// `BackgroundRefetch` and `Prefetch` wrappers mark failures that happened
/// off the caller's path; they are exposed as signals or logged, never
/// returned from a foreground call.
#[derive(Debug, Clone, Error)]
pub enum BlueprintError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Memo error: {0}")]
    Memo(#[from] MemoError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Background refetch failed: {0}")]
    BackgroundRefetch(Box<BlueprintError>),

    #[error("Prefetch of {target} failed: {source}")]
    Prefetch {
        target: String,
        source: Box<BlueprintError>,
    },
}

impl BlueprintError {
    /// Wrap an error raised during a stale-timer revalidation.
    pub fn background(err: BlueprintError) -> Self {
        Self::BackgroundRefetch(Box::new(err))
    }

    /// Wrap an error raised while warming the cache for `target`.
    pub fn prefetch(target: impl Into<String>, err: BlueprintError) -> Self {
        Self::Prefetch {
            target: target.into(),
            source: Box::new(err),
        }
    }

    /// True for failures that happened off the caller's path.
    pub fn is_background(&self) -> bool {
        matches!(self, Self::BackgroundRefetch(_) | Self::Prefetch { .. })
    }

    /// The innermost error, skipping background/prefetch wrappers.
    pub fn root_cause(&self) -> &BlueprintError {
        match self {
            Self::BackgroundRefetch(inner) => inner.root_cause(),
            Self::Prefetch { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for Blueprint operations.
pub type BlueprintResult<T> = Result<T, BlueprintError>;

// =============================================================================
// TESTS
// =============================================================================
