//! Device filtering.
//!
//! - `predicate` - the serializable predicate tree
//! - `engine` - compilation, evaluation and chunked list filtering

pub mod engine;
pub mod predicate;

pub use engine::*;
pub use predicate::*;
