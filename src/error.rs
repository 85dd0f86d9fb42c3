//! Error taxonomy.
//!
//! Decode-time conditions are absorbed locally and degrade to "fewer fields
//! recognized". Only store-layer failures and worker plumbing reach the caller
//! as [`RadarError`].

use thiserror::Error;

/// A non-fatal condition raised while decoding one advertisement.
///
/// Collected on the observation for diagnostics; never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeIssue {
    /// An element's length byte ran past the end of the buffer. Records
    /// decoded before `offset` are still returned.
    #[error("truncated frame at offset {offset}: element declares {declared} bytes, {available} available")]
    TruncatedFrame {
        offset: usize,
        declared: usize,
        available: usize,
    },

    /// The vendor sub-protocol payload could not be parsed; no contact
    /// hashes were extracted from it.
    #[error("malformed vendor payload for company 0x{company_id:04X}: {reason}")]
    MalformedVendorPayload { company_id: u16, reason: String },
}

/// Failure reported by a store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },
}

impl StoreError {
    pub fn unavailable(operation: &str, reason: impl Into<String>) -> Self {
        StoreError::Unavailable {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to callers of merge, match and batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadarError {
    /// The store collaborator failed. The batch is not consumed and may be
    /// resubmitted.
    #[error("store unavailable during {operation}: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    #[error("batch queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("pipeline worker has stopped")]
    WorkerStopped,

    #[error("failed to spawn {thread} thread: {reason}")]
    Spawn { thread: String, reason: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl RadarError {
    /// Whether resubmitting the same batch later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RadarError::StoreUnavailable { .. } | RadarError::QueueFull { .. }
        )
    }
}

impl From<StoreError> for RadarError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { operation, reason } => {
                RadarError::StoreUnavailable { operation, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_to_retryable() {
        let err: RadarError = StoreError::unavailable("device_upsert", "disk I/O").into();
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "store unavailable during device_upsert: disk I/O"
        );
    }

    #[test]
    fn test_worker_stopped_not_retryable() {
        assert!(!RadarError::WorkerStopped.is_retryable());
        assert!(!RadarError::Config {
            message: "x".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_decode_issue_display() {
        let issue = DecodeIssue::TruncatedFrame {
            offset: 3,
            declared: 9,
            available: 4,
        };
        assert!(issue.to_string().contains("offset 3"));

        let issue = DecodeIssue::MalformedVendorPayload {
            company_id: 0x004C,
            reason: "short".to_string(),
        };
        assert!(issue.to_string().contains("0x004C"));
    }
}
