//! Error types for the EC object core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while addressing, splitting or recovering EC I/O
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Descriptor or buffer allocation failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Malformed extent, parity bit misuse or mismatched record size
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport-reported failure for a specific target
    #[error("I/O failure on target {tgt}: {reason}")]
    IoFailure { tgt: u32, reason: String },

    /// Unrecoverable inconsistency or too many failed targets
    #[error("Data loss: {0}")]
    DataLoss(String),

    /// Inconsistency explained by a concurrent write, re-issue the fetch
    #[error("Fetch again: {0}")]
    FetchAgain(String),

    /// The owning request was aborted
    #[error("Request cancelled")]
    Cancelled,

    /// A shard operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// Insufficient shards for reconstruction
    #[error("Insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// GF matrix operation failed
    #[error("EC matrix operation failed: {0}")]
    MatrixError(String),

    /// Object class not registered
    #[error("Object class not found: {0}")]
    ClassNotFound(u32),

    // =========================================================================
    // Plumbing Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Closed set of error kinds a caller has to distinguish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidArgument,
    IoFailure,
    DataLoss,
    RetryableRace,
    Other,
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::InvalidArgument(_) | Error::InvalidEcConfig(_) => ErrorKind::InvalidArgument,
            Error::IoFailure { .. } | Error::Timeout(_) | Error::Io(_) => ErrorKind::IoFailure,
            Error::DataLoss(_) | Error::InsufficientShards { .. } => ErrorKind::DataLoss,
            Error::FetchAgain(_) => ErrorKind::RetryableRace,
            _ => ErrorKind::Other,
        }
    }

    /// Only a detected benign race is retried automatically
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::RetryableRace
    }
}

/// Allocate a vector with exactly `n` slots, reporting allocation failure
pub(crate) fn try_alloc<T>(n: usize, what: &str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|e| Error::OutOfMemory(format!("{} ({} items): {}", what, n, e)))?;
    Ok(v)
}

/// Allocate a zero-filled byte buffer, reporting allocation failure
pub(crate) fn try_alloc_zeroed(n: usize, what: &str) -> Result<Vec<u8>> {
    let mut v = try_alloc::<u8>(n, what)?;
    v.resize(n, 0);
    Ok(v)
}
