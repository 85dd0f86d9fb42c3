//! Pipeline context management.
//!
//! Provides batch and device context for logging and timing.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::logging::structured::LogContext;

/// Context for one scan batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub batch_id: String,
    /// When the batch was handed to the pipeline.
    pub received_at: DateTime<Utc>,
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchContext {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Context with a fixed receive time, for replay and tests.
    pub fn at(received_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: format!("batch-{}", &Uuid::new_v4().to_string()[..8]),
            received_at,
        }
    }

    /// Context whose receive time is `ms` since the Unix epoch. Out-of-range
    /// values fall back to the current time.
    pub fn at_millis(ms: i64) -> Self {
        let received_at = Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
        Self::at(received_at)
    }

    pub fn received_ms(&self) -> i64 {
        self.received_at.timestamp_millis()
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::new(&self.batch_id)
    }

    /// Create a log context for one device within this batch.
    pub fn device_context(&self, address: &str) -> LogContext {
        LogContext::new(&self.batch_id).with_device(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_shape() {
        let ctx = BatchContext::new();
        assert!(ctx.batch_id.starts_with("batch-"));
        assert_eq!(ctx.batch_id.len(), "batch-".len() + 8);
        assert_ne!(ctx.batch_id, BatchContext::new().batch_id);
    }

    #[test]
    fn test_at_millis() {
        let ctx = BatchContext::at_millis(1_700_000_000_123);
        assert_eq!(ctx.received_ms(), 1_700_000_000_123);
    }

    #[test]
    fn test_device_context_display() {
        let ctx = BatchContext::new();
        let rendered = ctx.device_context("AA:BB").to_string();
        assert_eq!(rendered, format!("[batch={}] [device=AA:BB]", ctx.batch_id));
    }
}
