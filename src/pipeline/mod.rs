//! Pipeline orchestration module.
//!
//! Scan ingestion pipeline that coordinates:
//! - Frame decoding and manufacturer resolution
//! - Device record and contact association merging
//! - Radar profile matching with cooldown
//! - Sharded background processing

pub mod context;
pub mod ingestion;
pub mod locks;
pub mod matching;
pub mod merge;
pub mod observation;
pub mod worker;

pub use context::*;
pub use ingestion::*;
pub use locks::*;
pub use matching::*;
pub use merge::*;
pub use observation::*;
pub use worker::*;
