//! In-memory store.
//!
//! Implements every store contract on `parking_lot` locks. Used by tests,
//! benches and embedders that persist elsewhere. `set_available(false)`
//! makes every call fail with [`StoreError::Unavailable`];
//! `limit_device_writes(n)` fails device writes after the next `n`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::decoder::vendor::ContactHash;
use crate::error::StoreError;
use crate::storage::models::{ContactAssociation, DeviceRecord, ProfileDetection, RadarProfile};
use crate::storage::store::{ContactStore, DetectionStore, DeviceStore, ProfileStore, StoreResult};

#[derive(Debug)]
pub struct InMemoryStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    contacts: RwLock<HashMap<ContactHash, ContactAssociation>>,
    detections: RwLock<Vec<ProfileDetection>>,
    profiles: RwLock<Vec<RadarProfile>>,
    next_detection_id: AtomicI64,
    available: AtomicBool,
    device_write_budget: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            contacts: RwLock::new(HashMap::new()),
            detections: RwLock::new(Vec::new()),
            profiles: RwLock::new(Vec::new()),
            next_detection_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
            device_write_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Let `n` more device writes succeed; later ones fail as if the store
    /// went offline. `usize::MAX` lifts the limit.
    pub fn limit_device_writes(&self, n: usize) {
        self.device_write_budget.store(n, Ordering::SeqCst);
    }

    /// Insert or replace a profile by id.
    pub fn upsert_profile(&self, profile: RadarProfile) {
        let mut profiles = self.profiles.write();
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
    }

    /// Replace all profiles.
    pub fn load_profiles(&self, profiles: Vec<RadarProfile>) {
        log::info!("PROFILES_LOADED count={}", profiles.len());
        *self.profiles.write() = profiles;
    }

    pub fn all_detections(&self) -> Vec<ProfileDetection> {
        self.detections.read().clone()
    }

    fn check(&self, operation: &str) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable(operation, "store offline"))
        }
    }

    fn take_device_write(&self) -> StoreResult<()> {
        self.device_write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(left),
                0 => None,
                _ => Some(left - 1),
            })
            .map(|_| ())
            .map_err(|_| StoreError::unavailable("upsert_device", "write limit reached"))
    }
}

impl DeviceStore for InMemoryStore {
    fn get_device(&self, address: &str) -> StoreResult<Option<DeviceRecord>> {
        self.check("get_device")?;
        Ok(self.devices.read().get(address).cloned())
    }

    fn upsert_device(&self, record: &DeviceRecord) -> StoreResult<()> {
        self.check("upsert_device")?;
        self.take_device_write()?;
        self.devices
            .write()
            .insert(record.address.clone(), record.clone());
        Ok(())
    }

    fn all_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        self.check("all_devices")?;
        let mut records: Vec<DeviceRecord> = self.devices.read().values().cloned().collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(records)
    }

    fn delete_devices(&self, addresses: &[String]) -> StoreResult<usize> {
        self.check("delete_devices")?;
        let mut devices = self.devices.write();
        Ok(addresses
            .iter()
            .filter(|address| devices.remove(address.as_str()).is_some())
            .count())
    }

    fn device_count(&self) -> StoreResult<usize> {
        self.check("device_count")?;
        Ok(self.devices.read().len())
    }
}

impl ContactStore for InMemoryStore {
    fn get_contact(&self, hash: ContactHash) -> StoreResult<Option<ContactAssociation>> {
        self.check("get_contact")?;
        Ok(self.contacts.read().get(&hash).cloned())
    }

    fn upsert_contact(&self, association: &ContactAssociation) -> StoreResult<()> {
        self.check("upsert_contact")?;
        self.contacts
            .write()
            .insert(association.hash, association.clone());
        Ok(())
    }

    fn contacts_for_address(&self, address: &str) -> StoreResult<Vec<ContactAssociation>> {
        self.check("contacts_for_address")?;
        let mut found: Vec<ContactAssociation> = self
            .contacts
            .read()
            .values()
            .filter(|a| a.address == address)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.hash);
        Ok(found)
    }

    fn all_contacts(&self) -> StoreResult<Vec<ContactAssociation>> {
        self.check("all_contacts")?;
        let mut all: Vec<ContactAssociation> = self.contacts.read().values().cloned().collect();
        all.sort_by_key(|a| a.hash);
        Ok(all)
    }

    fn delete_contacts(&self, hashes: &[ContactHash]) -> StoreResult<usize> {
        self.check("delete_contacts")?;
        let mut contacts = self.contacts.write();
        Ok(hashes
            .iter()
            .filter(|hash| contacts.remove(*hash).is_some())
            .count())
    }

    fn contact_count(&self) -> StoreResult<usize> {
        self.check("contact_count")?;
        Ok(self.contacts.read().len())
    }
}

impl DetectionStore for InMemoryStore {
    fn append_detection(&self, detection: &ProfileDetection) -> StoreResult<ProfileDetection> {
        self.check("append_detection")?;
        let mut stored = detection.clone();
        stored.id = Some(self.next_detection_id.fetch_add(1, Ordering::SeqCst));
        self.detections.write().push(stored.clone());
        Ok(stored)
    }

    fn last_detection(&self, profile_id: i64, address: &str) -> StoreResult<Option<ProfileDetection>> {
        self.check("last_detection")?;
        Ok(self
            .detections
            .read()
            .iter()
            .filter(|d| d.profile_id == profile_id && d.device_address == address)
            .max_by_key(|d| d.trigger_time_ms)
            .cloned())
    }

    fn detections_between(
        &self,
        profile_id: i64,
        address: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<Vec<ProfileDetection>> {
        self.check("detections_between")?;
        let mut found: Vec<ProfileDetection> = self
            .detections
            .read()
            .iter()
            .filter(|d| {
                d.profile_id == profile_id
                    && d.device_address == address
                    && d.trigger_time_ms >= from_ms
                    && d.trigger_time_ms <= to_ms
            })
            .cloned()
            .collect();
        found.sort_by_key(|d| d.trigger_time_ms);
        Ok(found)
    }

    fn detection_count(&self) -> StoreResult<usize> {
        self.check("detection_count")?;
        Ok(self.detections.read().len())
    }
}

impl ProfileStore for InMemoryStore {
    fn active_profiles(&self) -> StoreResult<Vec<RadarProfile>> {
        self.check("active_profiles")?;
        Ok(self
            .profiles
            .read()
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(profile_id: i64, address: &str, at: i64) -> ProfileDetection {
        ProfileDetection {
            id: None,
            profile_id,
            trigger_time_ms: at,
            device_address: address.to_string(),
        }
    }

    #[test]
    fn test_device_crud() {
        let store = InMemoryStore::new();
        store.upsert_device(&DeviceRecord::new("AA", 1)).unwrap();
        store.upsert_device(&DeviceRecord::new("BB", 2)).unwrap();
        assert_eq!(store.device_count().unwrap(), 2);
        assert_eq!(store.get_device("AA").unwrap().unwrap().first_seen_ms, 1);

        let found = store
            .devices_by_addresses(&["BB".to_string(), "ZZ".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);

        assert_eq!(store.delete_devices(&["AA".to_string(), "ZZ".to_string()]).unwrap(), 1);
        assert!(store.get_device("AA").unwrap().is_none());
    }

    #[test]
    fn test_detection_ids_and_queries() {
        let store = InMemoryStore::new();
        let first = store.append_detection(&detection(1, "AA", 1_000)).unwrap();
        let second = store.append_detection(&detection(1, "AA", 6_500)).unwrap();
        store.append_detection(&detection(2, "AA", 9_000)).unwrap();

        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
        assert_eq!(
            store.last_detection(1, "AA").unwrap().unwrap().trigger_time_ms,
            6_500
        );
        assert_eq!(store.detections_between(1, "AA", 0, 5_000).unwrap().len(), 1);
        assert!(store.last_detection(1, "BB").unwrap().is_none());
    }

    #[test]
    fn test_unavailable() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let err = store.get_device("AA").unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { ref operation, .. } if operation == "get_device"));
        store.set_available(true);
        assert!(store.get_device("AA").is_ok());
    }

    #[test]
    fn test_device_write_limit() {
        let store = InMemoryStore::new();
        store.limit_device_writes(1);
        assert!(store.upsert_device(&DeviceRecord::new("AA", 0)).is_ok());
        assert!(store.upsert_device(&DeviceRecord::new("BB", 0)).is_err());
        assert_eq!(store.device_count().unwrap(), 1);

        store.limit_device_writes(usize::MAX);
        assert!(store.upsert_device(&DeviceRecord::new("BB", 0)).is_ok());
    }

    #[test]
    fn test_active_profiles_only() {
        let store = InMemoryStore::new();
        store.load_profiles(vec![
            RadarProfile {
                id: 1,
                name: "on".to_string(),
                description: None,
                is_active: true,
                detect_filter: None,
                cooldown_ms: 0,
            },
            RadarProfile {
                id: 2,
                name: "off".to_string(),
                description: None,
                is_active: false,
                detect_filter: None,
                cooldown_ms: 0,
            },
        ]);
        let active = store.active_profiles().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
    }
}
