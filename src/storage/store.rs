//! Store collaborator contracts.
//!
//! The pipeline never owns persistence. It talks to these traits, and any
//! implementation (database, in-memory, remote) plugs in behind them. Every
//! method may fail with [`StoreError::Unavailable`]; callers treat that as
//! retryable.
//!
//! Implementations must be safe for concurrent use. Write serialization per
//! key is done by the pipeline, not by the store.

use crate::decoder::vendor::ContactHash;
use crate::error::StoreError;
use crate::storage::models::{ContactAssociation, DeviceRecord, ProfileDetection, RadarProfile};

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed access to device records, one per address.
pub trait DeviceStore: Send + Sync {
    fn get_device(&self, address: &str) -> StoreResult<Option<DeviceRecord>>;

    /// Insert or replace the record keyed by `record.address`.
    fn upsert_device(&self, record: &DeviceRecord) -> StoreResult<()>;

    fn all_devices(&self) -> StoreResult<Vec<DeviceRecord>>;

    /// Records for the given addresses; missing addresses are skipped.
    fn devices_by_addresses(&self, addresses: &[String]) -> StoreResult<Vec<DeviceRecord>> {
        let mut records = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Some(record) = self.get_device(address)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Returns the number of records removed.
    fn delete_devices(&self, addresses: &[String]) -> StoreResult<usize>;

    fn device_count(&self) -> StoreResult<usize>;
}

/// Contact associations keyed by hash.
pub trait ContactStore: Send + Sync {
    fn get_contact(&self, hash: ContactHash) -> StoreResult<Option<ContactAssociation>>;

    fn upsert_contact(&self, association: &ContactAssociation) -> StoreResult<()>;

    /// All associations currently pointing at `address`.
    fn contacts_for_address(&self, address: &str) -> StoreResult<Vec<ContactAssociation>>;

    /// Associations for any of `hashes`; unknown hashes are skipped.
    fn associations_by_hashes(&self, hashes: &[ContactHash]) -> StoreResult<Vec<ContactAssociation>> {
        let mut found = Vec::new();
        for hash in hashes {
            if let Some(association) = self.get_contact(*hash)? {
                found.push(association);
            }
        }
        Ok(found)
    }

    fn all_contacts(&self) -> StoreResult<Vec<ContactAssociation>>;

    /// Returns the number of associations removed.
    fn delete_contacts(&self, hashes: &[ContactHash]) -> StoreResult<usize>;

    fn contact_count(&self) -> StoreResult<usize>;
}

/// Append-only detection journal.
pub trait DetectionStore: Send + Sync {
    /// Append and return the detection with its assigned id.
    fn append_detection(&self, detection: &ProfileDetection) -> StoreResult<ProfileDetection>;

    /// Most recent detection (by trigger time) for the pair.
    fn last_detection(&self, profile_id: i64, address: &str) -> StoreResult<Option<ProfileDetection>>;

    /// Detections for the pair with `from_ms <= trigger_time_ms <= to_ms`,
    /// oldest first.
    fn detections_between(
        &self,
        profile_id: i64,
        address: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<Vec<ProfileDetection>>;

    fn detection_count(&self) -> StoreResult<usize>;
}

/// Read access to radar profiles.
pub trait ProfileStore: Send + Sync {
    fn active_profiles(&self) -> StoreResult<Vec<RadarProfile>>;
}

/// Everything the pipeline needs from persistence.
pub trait RadarStore: DeviceStore + ContactStore + DetectionStore + ProfileStore {}

impl<T> RadarStore for T where T: DeviceStore + ContactStore + DetectionStore + ProfileStore {}
