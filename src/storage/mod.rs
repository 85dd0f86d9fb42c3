//! Storage module.
//!
//! Persistent models and the store contracts the pipeline talks to.
//! Actual persistence is owned by the embedding application; `memory`
//! provides a reference implementation.

pub mod maintenance;
pub mod memory;
pub mod models;
pub mod store;

pub use maintenance::*;
pub use memory::*;
pub use models::*;
pub use store::*;
