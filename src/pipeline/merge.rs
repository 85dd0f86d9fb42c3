//! Merging observations into device records and contact associations.
//!
//! Each address is read, updated and written back while its address stripe
//! is held, so no reader sees a half-applied observation. The observation's
//! contact hashes are upserted under their own stripes inside that window,
//! before the device write. An observation therefore counts as applied once
//! its device write succeeds, and replaying one that was not applied only
//! repeats idempotent contact writes. Different addresses do not wait on
//! each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::decoder::vendor::ContactSighting;
use crate::error::RadarError;
use crate::logging::structured::LogContext;
use crate::pipeline::context::BatchContext;
use crate::pipeline::locks::StripedLocks;
use crate::pipeline::observation::DeviceObservation;
use crate::storage::models::{ContactAssociation, DeviceRecord};
use crate::storage::store::{ContactStore, DeviceStore, RadarStore};

/// Records touched by one merge call.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Latest state of every created or updated record, one per address,
    /// in order of first appearance in the batch.
    pub records: Vec<DeviceRecord>,
    pub created: usize,
    pub updated: usize,
    pub contacts_upserted: usize,
}

/// A merge stopped by a store failure.
#[derive(Debug)]
pub struct MergeFailure {
    pub error: RadarError,
    /// Input positions of the observations that were not applied, ascending.
    pub pending: Vec<usize>,
    /// What was applied before the failure.
    pub partial: MergeOutcome,
}

pub struct MergeEngine {
    store: Arc<dyn RadarStore>,
    address_locks: StripedLocks,
    contact_locks: StripedLocks,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn RadarStore>) -> Self {
        Self {
            store,
            address_locks: StripedLocks::default(),
            contact_locks: StripedLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RadarStore> {
        &self.store
    }

    /// Merge a batch of observations.
    ///
    /// Observations are applied in timestamp order. A store failure stops
    /// the call; the failure lists the observations still pending so that
    /// only those are retried.
    pub fn merge(
        &self,
        ctx: &BatchContext,
        observations: Vec<DeviceObservation>,
    ) -> Result<MergeOutcome, MergeFailure> {
        let mut order: Vec<usize> = (0..observations.len()).collect();
        order.sort_by_key(|&idx| observations[idx].timestamp_ms);

        let mut outcome = MergeOutcome::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (done, &idx) in order.iter().enumerate() {
            let observation = &observations[idx];
            let log_ctx = ctx.device_context(&observation.address);
            let (record, created, contacts) = match self.merge_one(observation, &log_ctx) {
                Ok(merged) => merged,
                Err(error) => {
                    let mut pending = order[done..].to_vec();
                    pending.sort_unstable();
                    crate::log_error!(
                        log_ctx,
                        "STORE_UNAVAILABLE",
                        error = error.to_string(),
                        applied = done,
                        pending = pending.len()
                    );
                    return Err(MergeFailure {
                        error,
                        pending,
                        partial: outcome,
                    });
                }
            };

            outcome.contacts_upserted += contacts;
            if created {
                outcome.created += 1;
            } else {
                outcome.updated += 1;
            }
            match positions.get(&record.address) {
                Some(&pos) => outcome.records[pos] = record,
                None => {
                    positions.insert(record.address.clone(), outcome.records.len());
                    outcome.records.push(record);
                }
            }
        }

        log::info!(
            "{} MERGE_COMPLETE observations={} created={} updated={} contacts={}",
            ctx.log_context(),
            observations.len(),
            outcome.created,
            outcome.updated,
            outcome.contacts_upserted
        );

        Ok(outcome)
    }

    /// Apply one observation. Returns the written record, whether it was
    /// created, and the number of contacts upserted.
    fn merge_one(
        &self,
        observation: &DeviceObservation,
        ctx: &LogContext,
    ) -> Result<(DeviceRecord, bool, usize), RadarError> {
        let _guard = self.address_locks.lock(observation.address.as_str());

        let (record, created) = match self.store.get_device(&observation.address)? {
            Some(mut existing) => {
                apply_observation(&mut existing, observation);
                (existing, false)
            }
            None => (record_from_observation(observation), true),
        };

        let mut contacts = 0;
        if let Some(airdrop) = observation
            .manufacturer
            .as_ref()
            .and_then(|m| m.airdrop.as_ref())
        {
            for sighting in &airdrop.contacts {
                self.upsert_contact(&observation.address, sighting, ctx)?;
                contacts += 1;
            }
        }

        self.store.upsert_device(&record)?;

        if created {
            crate::log_debug!(ctx, "DEVICE_CREATED", first_seen_ms = record.first_seen_ms);
        } else {
            crate::log_debug!(
                ctx,
                "DEVICE_UPDATED",
                detect_count = record.detect_count,
                last_seen_ms = record.last_seen_ms
            );
        }
        Ok((record, created, contacts))
    }

    fn upsert_contact(
        &self,
        address: &str,
        sighting: &ContactSighting,
        ctx: &LogContext,
    ) -> Result<(), RadarError> {
        let _guard = self.contact_locks.lock(&sighting.hash);

        let association = match self.store.get_contact(sighting.hash)? {
            None => ContactAssociation {
                hash: sighting.hash,
                address: address.to_string(),
                first_seen_ms: sighting.first_seen_ms,
                last_seen_ms: sighting.last_seen_ms,
            },
            Some(mut existing) => {
                let newer = sighting.last_seen_ms >= existing.last_seen_ms;
                if existing.address != address && newer {
                    crate::log_info!(
                        ctx,
                        "CONTACT_REASSIGNED",
                        hash = sighting.hash.to_string(),
                        from = existing.address.as_str()
                    );
                    existing.address = address.to_string();
                }
                existing.first_seen_ms = existing.first_seen_ms.min(sighting.first_seen_ms);
                existing.last_seen_ms = existing.last_seen_ms.max(sighting.last_seen_ms);
                existing
            }
        };

        self.store.upsert_contact(&association)?;
        Ok(())
    }

    /// Delete contact associations whose address has no device record.
    ///
    /// Candidates come from a snapshot and are re-read while their address
    /// and hash stripes are held, so an association written by a concurrent
    /// merge is kept. Returns the number of associations removed.
    pub fn clear_unassociated_contacts(&self) -> Result<usize, RadarError> {
        let known: HashSet<String> = self
            .store
            .all_devices()?
            .into_iter()
            .map(|record| record.address)
            .collect();
        let candidates: Vec<ContactAssociation> = self
            .store
            .all_contacts()?
            .into_iter()
            .filter(|a| !known.contains(&a.address))
            .collect();

        let mut removed = 0;
        for candidate in candidates {
            let _address = self.address_locks.lock(candidate.address.as_str());
            let _hash = self.contact_locks.lock(&candidate.hash);

            let still_orphaned = match self.store.get_contact(candidate.hash)? {
                Some(current) if current.address == candidate.address => {
                    self.store.get_device(&candidate.address)?.is_none()
                }
                _ => false,
            };
            if still_orphaned {
                removed += self.store.delete_contacts(&[candidate.hash])?;
            }
        }

        if removed > 0 {
            log::info!("CONTACTS_GC removed={}", removed);
        }
        Ok(removed)
    }

    /// Record that `address` was flagged as following the user at `time_ms`.
    ///
    /// Returns the updated record, or `None` for an unknown address.
    pub fn save_following_detection(
        &self,
        address: &str,
        time_ms: i64,
    ) -> Result<Option<DeviceRecord>, RadarError> {
        let _guard = self.address_locks.lock(address);

        let mut record = match self.store.get_device(address)? {
            Some(record) => record,
            None => return Ok(None),
        };
        record.last_following_detection_ms = Some(time_ms);
        self.store.upsert_device(&record)?;

        log::info!("[device={}] FOLLOWING_DETECTION_SAVED time_ms={}", address, time_ms);
        Ok(Some(record))
    }
}

fn record_from_observation(observation: &DeviceObservation) -> DeviceRecord {
    let mut record = DeviceRecord::new(&observation.address, observation.timestamp_ms);
    overwrite_transient(&mut record, observation);
    record
}

/// Fold a later sighting into an existing record. User-owned fields are
/// never touched. An observation older than the stored `last_seen_ms` only
/// counts; it does not overwrite newer data.
fn apply_observation(record: &mut DeviceRecord, observation: &DeviceObservation) {
    record.detect_count += 1;
    record.first_seen_ms = record.first_seen_ms.min(observation.timestamp_ms);
    if observation.timestamp_ms >= record.last_seen_ms {
        record.last_seen_ms = observation.timestamp_ms;
        overwrite_transient(record, observation);
    }
}

fn overwrite_transient(record: &mut DeviceRecord, observation: &DeviceObservation) {
    if observation.name.is_some() {
        record.name = observation.name.clone();
    }
    if observation.rssi.is_some() {
        record.rssi = observation.rssi;
    }
    if observation.manufacturer.is_some() {
        record.manufacturer = observation.manufacturer.clone();
    }
    if observation.metadata.is_some() {
        record.metadata = observation.metadata.clone();
    }
    if observation.address_type.is_some() {
        record.address_type = observation.address_type;
    }
    if observation.device_class.is_some() {
        record.device_class = observation.device_class;
    }
    record.service_uuids = observation.service_uuids.iter().copied().collect();
    record.is_connectable = observation.is_connectable;
    record.is_paired = observation.is_paired;
    record.raw_data_encoded = Some(DeviceRecord::encode_raw(&observation.raw));
}
