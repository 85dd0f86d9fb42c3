//! Advertisement decoding.
//!
//! Raw bytes to typed records:
//! - `frame` - length-prefixed AD structure decoding
//! - `manufacturer` - company identifier resolution
//! - `vendor` - vendor sub-protocol (contact hash) extraction

pub mod frame;
pub mod manufacturer;
pub mod vendor;

pub use frame::*;
pub use manufacturer::*;
pub use vendor::*;
