//! Store maintenance and summary queries.
//!
//! Orphaned contact collection needs the merge locks and lives on
//! `MergeEngine::clear_unassociated_contacts`.

use serde::Serialize;

use crate::storage::models::DeviceRecord;
use crate::storage::store::{ContactStore, DetectionStore, DeviceStore, StoreResult};

/// Row counts across the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub device_count: usize,
    pub contact_count: usize,
    pub detection_count: usize,
}

/// Records seen in the most recent scan, i.e. sharing the latest `last_seen_ms`.
pub fn last_batch<S>(store: &S) -> StoreResult<Vec<DeviceRecord>>
where
    S: DeviceStore + ?Sized,
{
    let records = store.all_devices()?;
    let latest = match records.iter().map(|r| r.last_seen_ms).max() {
        Some(latest) => latest,
        None => return Ok(Vec::new()),
    };
    Ok(records
        .into_iter()
        .filter(|r| r.last_seen_ms == latest)
        .collect())
}

pub fn database_info<S>(store: &S) -> StoreResult<DatabaseInfo>
where
    S: DeviceStore + ContactStore + DetectionStore + ?Sized,
{
    Ok(DatabaseInfo {
        device_count: store.device_count()?,
        contact_count: store.contact_count()?,
        detection_count: store.detection_count()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::decoder::vendor::ContactHash;
    use crate::storage::models::{ContactAssociation, ProfileDetection};

    fn contact(hash: u32, address: &str) -> ContactAssociation {
        ContactAssociation {
            hash: ContactHash(hash),
            address: address.to_string(),
            first_seen_ms: 0,
            last_seen_ms: 0,
        }
    }

    #[test]
    fn test_last_batch() {
        let store = InMemoryStore::new();
        assert!(last_batch(&store).unwrap().is_empty());

        store.upsert_device(&DeviceRecord::new("AA", 1_000)).unwrap();
        store.upsert_device(&DeviceRecord::new("BB", 2_000)).unwrap();
        store.upsert_device(&DeviceRecord::new("CC", 2_000)).unwrap();

        let latest: Vec<String> = last_batch(&store)
            .unwrap()
            .into_iter()
            .map(|r| r.address)
            .collect();
        assert_eq!(latest, vec!["BB".to_string(), "CC".to_string()]);
    }

    #[test]
    fn test_database_info() {
        let store = InMemoryStore::new();
        store.upsert_device(&DeviceRecord::new("AA", 0)).unwrap();
        store.upsert_contact(&contact(1, "AA")).unwrap();
        store
            .append_detection(&ProfileDetection {
                id: None,
                profile_id: 1,
                trigger_time_ms: 0,
                device_address: "AA".to_string(),
            })
            .unwrap();

        assert_eq!(
            database_info(&store).unwrap(),
            DatabaseInfo {
                device_count: 1,
                contact_count: 1,
                detection_count: 1
            }
        );
    }

    #[test]
    fn test_maintenance_propagates_unavailable() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(database_info(&store).is_err());
        assert!(last_batch(&store).is_err());
    }
}
