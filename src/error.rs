//! Crate-wide error taxonomy.
//!
//! Kinds mirror the classification the storage engine's components reason
//! about: transient vs. permanent store errors, bus errors, pool exhaustion,
//! config failures, and migration verification mismatches. Components match
//! on `StorageError::is_retryable` / `is_schema_mismatch` rather than on
//! string contents.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Retryable store error: HTTP 5xx, connect/read timeout.
    #[error("store transient error: {0}")]
    StoreTransient(String),

    /// Store signaled a rate limit or "busy" condition; retry with a longer
    /// base delay than a plain transient error.
    #[error("store rate limited: {0}")]
    StoreRateLimit(String),

    /// 4xx with a JSON error body carrying a non-retryable store error code.
    #[error("store rejected batch: {0}")]
    StoreReject(String),

    /// 4xx without retryable semantics.
    #[error("store permanent error: {0}")]
    StorePermanent(String),

    /// Declared columns diverge from the payload shape.
    #[error("schema mismatch on table {table}: {detail}")]
    StoreSchemaMismatch { table: String, detail: String },

    /// Bus connection dropped; reconnect with backoff, no record loss.
    #[error("bus transient error: {0}")]
    BusTransient(String),

    /// Bus failure the process cannot recover from internally.
    #[error("bus permanent error: {0}")]
    BusPermanent(String),

    /// Connection pool wait budget expired.
    #[error("connection pool exhausted after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// Startup-only fatal configuration error.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Migration verification found a hot/cold row-count mismatch.
    #[error("verification mismatch for {table} partition {partition}: hot={hot} cold={cold}")]
    VerificationMismatch {
        table: String,
        partition: String,
        hot: u64,
        cold: u64,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Errors the Tier Writer and Bus Subscriber should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::StoreTransient(_)
                | StorageError::StoreRateLimit(_)
                | StorageError::PoolExhausted { .. }
                | StorageError::BusTransient(_)
        )
    }

    /// Errors that should trigger row-by-row isolation rather than a whole-batch retry.
    pub fn is_batch_poison(&self) -> bool {
        matches!(
            self,
            StorageError::StoreReject(_)
                | StorageError::StorePermanent(_)
                | StorageError::StoreSchemaMismatch { .. }
        )
    }

    /// The base backoff delay for this error's retry class.
    pub fn base_delay_secs(&self) -> u64 {
        match self {
            StorageError::StoreRateLimit(_) => 5,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
