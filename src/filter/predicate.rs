//! Predicate trees for radar profiles and device list filtering.
//!
//! A closed set of variants: the `all`/`any`/`not` combinators plus one leaf
//! per device field. Serialized with an internal `type` tag, e.g.
//! `{"type": "not", "filter": {"type": "manufacturer", "id": 76}}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::APPLE_COMPANY_ID;
use crate::decoder::vendor::ContactHash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// True when every child is true; true when empty.
    All { filters: Vec<Predicate> },
    /// True when any child is true; false when empty.
    Any { filters: Vec<Predicate> },
    Not { filter: Box<Predicate> },

    Manufacturer { id: u16 },
    /// The record's tag set contains `tag` (exact).
    ByTag { tag: String },
    IsFavorite { favorite: bool },
    /// Regex over custom, fetched and advertised names.
    Name {
        pattern: String,
        #[serde(default)]
        ignore_case: bool,
    },
    /// Case-insensitive address equality.
    Address { address: String },
    MinRssi { min_rssi: i16 },
    /// Last seen no longer than `within_ms` before the evaluation time.
    LastSeenWithin { within_ms: i64 },
    /// First seen inside the (inclusive, open-ended) range.
    FirstSeenBetween {
        #[serde(default)]
        from_ms: Option<i64>,
        #[serde(default)]
        to_ms: Option<i64>,
    },
    MinDetectCount { count: u64 },
    ServiceUuid { uuid: Uuid },
    AirdropContact { hash: ContactHash },
    /// Has ever been flagged as following the user.
    IsFollowing,
    IsPaired,
    IsConnectable,
}

impl Predicate {
    pub fn all(filters: Vec<Predicate>) -> Self {
        Predicate::All { filters }
    }

    pub fn any(filters: Vec<Predicate>) -> Self {
        Predicate::Any { filters }
    }

    pub fn not(filter: Predicate) -> Self {
        Predicate::Not {
            filter: Box::new(filter),
        }
    }

    pub fn manufacturer(id: u16) -> Self {
        Predicate::Manufacturer { id }
    }

    pub fn tag(tag: &str) -> Self {
        Predicate::ByTag {
            tag: tag.to_string(),
        }
    }

    pub fn name(pattern: &str, ignore_case: bool) -> Self {
        Predicate::Name {
            pattern: pattern.to_string(),
            ignore_case,
        }
    }

    pub fn address(address: &str) -> Self {
        Predicate::Address {
            address: address.to_string(),
        }
    }

    /// Quick filter: hide the reserved vendor's devices.
    pub fn not_apple() -> Self {
        Predicate::not(Predicate::manufacturer(APPLE_COMPANY_ID))
    }

    /// Quick filter: favorites only.
    pub fn is_favorite() -> Self {
        Predicate::IsFavorite { favorite: true }
    }

    /// Combine applied filters: none, the single one, or all of them.
    pub fn combine(mut filters: Vec<Predicate>) -> Option<Predicate> {
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Predicate::all(filters)),
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        match self {
            Predicate::All { filters } | Predicate::Any { filters } => {
                1 + filters.iter().map(Predicate::node_count).sum::<usize>()
            }
            Predicate::Not { filter } => 1 + filter.node_count(),
            _ => 1,
        }
    }
}
