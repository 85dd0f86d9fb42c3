//! Radar Core - BLE advertisement ingestion pipeline
//!
//! Turns raw advertisement frames from an external scanner into persistent
//! device records, contact associations and radar profile detections. The
//! implementation prioritizes:
//!
//! 1. **Robustness** - Malformed frames degrade to fewer recognized fields, never a failed batch
//! 2. **Logging** - Every decision point logged with batch and device context
//! 3. **Concurrency** - Per-address ordering with cross-address parallelism
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `decoder` - AD structure decoding, manufacturer and vendor payload resolution
//! - `filter` - Predicate trees, evaluation and device list filtering
//! - `pipeline` - Merge, match, batch orchestration and the sharded worker
//! - `storage` - Models, store contracts and an in-memory store
//! - `config` - Pipeline configuration
//! - `error` - Error taxonomy
//! - `logging` - Structured logging with batch context

pub mod config;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod logging;
pub mod pipeline;
pub mod storage;

pub use config::{AirDropLayout, PipelineConfig};
pub use error::{DecodeIssue, RadarError, StoreError};
pub use filter::{CompiledFilter, EvalContext, Predicate};
pub use pipeline::{BatchContext, BatchFailure, BatchResult, Pipeline, PipelineWorker, RawScan};
pub use storage::{DeviceRecord, InMemoryStore, RadarStore};

/// Initialize the logger. Safe to call more than once; `RUST_LOG` overrides
/// the default `info` level.
pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_idempotent() {
        init_logger();
        init_logger();
    }
}
