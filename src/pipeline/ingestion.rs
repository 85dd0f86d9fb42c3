//! Main scan ingestion pipeline.
//!
//! Coordinates the full batch workflow:
//! 1. Frame decoding and manufacturer resolution (absorbs malformed input)
//! 2. Merge into device records and contact associations
//! 3. Profile matching with cooldown
//! 4. Return the changed records and emitted detections
//!
//! `process_batch` runs all steps on the calling thread. The sharded worker
//! in `worker` runs the same steps off the scanner's thread.

use std::sync::Arc;

use thiserror::Error;

use crate::config::PipelineConfig;
use crate::decoder::manufacturer::ManufacturerResolver;
use crate::error::RadarError;
use crate::filter::engine::{filter_devices, CompiledFilter, EvalContext};
use crate::filter::predicate::Predicate;
use crate::pipeline::context::BatchContext;
use crate::pipeline::matching::MatchEngine;
use crate::pipeline::merge::{MergeEngine, MergeOutcome};
use crate::pipeline::observation::{DeviceObservation, RawScan};
use crate::storage::models::{DeviceRecord, ProfileDetection};
use crate::storage::store::{ContactStore, DeviceStore, RadarStore};

/// Result of processing a batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: String,
    pub received_count: usize,
    /// Decode conditions absorbed across the batch.
    pub issue_count: usize,
    pub created_count: usize,
    pub updated_count: usize,
    pub contacts_upserted: usize,
    /// Every record created or updated by this batch.
    pub records: Vec<DeviceRecord>,
    pub detections: Vec<ProfileDetection>,
}

/// A batch stopped by a store failure.
///
/// `scans` holds only the scans that were not merged, so resubmitting them
/// never counts an observation twice. `unmatched` holds records that were
/// merged but not matched against the radar profiles; hand them to
/// [`MatchEngine::match_records`] once the store is back.
#[derive(Debug, Clone, Error)]
#[error("batch {batch_id} failed: {error}")]
pub struct BatchFailure {
    pub batch_id: String,
    #[source]
    pub error: RadarError,
    pub scans: Vec<RawScan>,
    pub unmatched: Vec<DeviceRecord>,
}

impl BatchFailure {
    /// Failure carrying the scans at the `pending` positions of `scans`.
    pub(crate) fn new(
        ctx: &BatchContext,
        error: RadarError,
        scans: &[RawScan],
        pending: &[usize],
        unmatched: Vec<DeviceRecord>,
    ) -> Self {
        Self {
            batch_id: ctx.batch_id.clone(),
            error,
            scans: pending.iter().filter_map(|&i| scans.get(i).cloned()).collect(),
            unmatched,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    resolver: ManufacturerResolver,
    merge: MergeEngine,
    matcher: MatchEngine,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RadarStore>, config: PipelineConfig) -> Self {
        let resolver = ManufacturerResolver::new(config.airdrop.clone());
        Self::with_resolver(store, config, resolver)
    }

    /// Pipeline with a caller-built resolver (custom vendor strategies).
    pub fn with_resolver(
        store: Arc<dyn RadarStore>,
        config: PipelineConfig,
        resolver: ManufacturerResolver,
    ) -> Self {
        Self {
            config,
            resolver,
            merge: MergeEngine::new(store.clone()),
            matcher: MatchEngine::new(store),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RadarStore> {
        self.merge.store()
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    pub fn match_engine(&self) -> &MatchEngine {
        &self.matcher
    }

    /// Decode every scan of a batch. Never fails.
    pub fn decode(&self, ctx: &BatchContext, scans: Vec<RawScan>) -> Vec<DeviceObservation> {
        scans
            .into_iter()
            .map(|scan| {
                let log_ctx = ctx.device_context(&scan.address);
                DeviceObservation::decode(scan, &self.resolver, &log_ctx)
            })
            .collect()
    }

    /// Process a batch of scans.
    ///
    /// Main entry point for synchronous callers. On failure the returned
    /// [`BatchFailure`] carries the scans that still need merging.
    pub fn process_batch(
        &self,
        ctx: &BatchContext,
        scans: Vec<RawScan>,
    ) -> Result<BatchResult, BatchFailure> {
        let received = scans.len();
        log::info!("{} BATCH_RECEIVED scans={}", ctx.log_context(), received);

        let observations = self.decode(ctx, scans.clone());
        let issue_count = observations.iter().map(|o| o.issues.len()).sum();

        let merged = self.merge.merge(ctx, observations).map_err(|failure| {
            BatchFailure::new(
                ctx,
                failure.error,
                &scans,
                &failure.pending,
                failure.partial.records,
            )
        })?;
        self.complete(ctx, received, issue_count, merged)
    }

    /// Match merged records and assemble the result. A matching failure
    /// leaves every scan merged, so only the records are handed back.
    pub(crate) fn complete(
        &self,
        ctx: &BatchContext,
        received: usize,
        issue_count: usize,
        merged: MergeOutcome,
    ) -> Result<BatchResult, BatchFailure> {
        match self.matcher.match_records(ctx, &merged.records) {
            Ok(detections) => Ok(self.finish(ctx, received, issue_count, merged, detections)),
            Err(error) => Err(BatchFailure::new(ctx, error, &[], &[], merged.records)),
        }
    }

    /// Assemble and log the batch result.
    fn finish(
        &self,
        ctx: &BatchContext,
        received: usize,
        issue_count: usize,
        merged: MergeOutcome,
        detections: Vec<ProfileDetection>,
    ) -> BatchResult {
        log::info!(
            "{} BATCH_COMPLETE received={} issues={} created={} updated={} detections={}",
            ctx.log_context(),
            received,
            issue_count,
            merged.created,
            merged.updated,
            detections.len()
        );

        BatchResult {
            batch_id: ctx.batch_id.clone(),
            received_count: received,
            issue_count,
            created_count: merged.created,
            updated_count: merged.updated,
            contacts_upserted: merged.contacts_upserted,
            records: merged.records,
            detections,
        }
    }

    /// One device with its stored contact associations attached.
    pub fn device_with_contacts(&self, address: &str) -> Result<Option<DeviceRecord>, RadarError> {
        let store = self.store();
        let record = match store.get_device(address)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let contacts = store.contacts_for_address(address)?;
        Ok(Some(record.with_contacts(&contacts)))
    }

    /// The stored device list narrowed by applied filters and a search query.
    pub fn filtered_devices(
        &self,
        filters: Vec<Predicate>,
        query: Option<&str>,
        now_ms: i64,
    ) -> Result<Vec<DeviceRecord>, RadarError> {
        let records = self.store().all_devices()?;
        let compiled = Predicate::combine(filters).map(|tree| CompiledFilter::compile(&tree));
        Ok(filter_devices(
            &records,
            compiled.as_ref(),
            query,
            &EvalContext::at(now_ms),
            self.config.filter_chunk_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::vendor::ContactHash;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::models::RadarProfile;

    fn pipeline() -> (Arc<InMemoryStore>, Pipeline) {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = Pipeline::new(store.clone(), PipelineConfig::default());
        (store, pipeline)
    }

    fn scan(address: &str, raw: Vec<u8>, at: i64) -> RawScan {
        RawScan {
            address: address.to_string(),
            raw,
            rssi: Some(-60),
            timestamp_ms: at,
            ..Default::default()
        }
    }

    fn airdrop_raw(hash: u16) -> Vec<u8> {
        let mut body = vec![0u8; 18];
        body[8] = 0x01;
        body[9..11].copy_from_slice(&hash.to_be_bytes());
        let mut payload = vec![0x4C, 0x00, 0x05, 18];
        payload.extend_from_slice(&body);
        let mut raw = vec![(payload.len() + 1) as u8, 0xFF];
        raw.extend_from_slice(&payload);
        raw
    }

    #[test]
    fn test_process_batch_end_to_end() {
        let (store, pipeline) = pipeline();
        store.load_profiles(vec![RadarProfile {
            id: 7,
            name: "apple".to_string(),
            description: None,
            is_active: true,
            detect_filter: Some(Predicate::manufacturer(76)),
            cooldown_ms: 5_000,
        }]);

        let ctx = BatchContext::new();
        let result = pipeline
            .process_batch(
                &ctx,
                vec![
                    scan("AA:BB", vec![0x02, 0x01, 0x06, 0x05, 0xFF, 0x4C, 0x00, 0x10, 0x5A], 1_000),
                    scan("CC:DD", vec![0x02, 0x01, 0x06, 0x09, 0x09], 1_000),
                ],
            )
            .unwrap();

        assert_eq!(result.batch_id, ctx.batch_id);
        assert_eq!(result.received_count, 2);
        assert_eq!(result.created_count, 2);
        // Malformed vendor payload on AA:BB, truncated frame on CC:DD
        assert_eq!(result.issue_count, 2);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].device_address, "AA:BB");
    }

    #[test]
    fn test_contacts_attached_on_read() {
        let (_, pipeline) = pipeline();
        pipeline
            .process_batch(&BatchContext::new(), vec![scan("AA", airdrop_raw(0xBEEF), 5)])
            .unwrap();

        let record = pipeline.device_with_contacts("AA").unwrap().unwrap();
        assert_eq!(record.contact_hashes().collect::<Vec<_>>(), vec![ContactHash(0xBEEF)]);
        assert!(pipeline.device_with_contacts("ZZ").unwrap().is_none());
    }

    #[test]
    fn test_filtered_devices() {
        let (_, pipeline) = pipeline();
        pipeline
            .process_batch(
                &BatchContext::new(),
                vec![
                    scan("AA", vec![0x05, 0xFF, 0x4C, 0x00, 0x10, 0x5A], 1),
                    scan("BB", vec![0x05, 0xFF, 0x75, 0x00, 0x01, 0x02], 1),
                ],
            )
            .unwrap();

        let visible = pipeline
            .filtered_devices(vec![Predicate::not_apple()], None, 10)
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].address, "BB");

        let searched = pipeline.filtered_devices(vec![], Some("samsung"), 10).unwrap();
        assert_eq!(searched.len(), 1);
    }

    #[test]
    fn test_store_down_fails_batch() {
        let (store, pipeline) = pipeline();
        store.set_available(false);
        let failure = pipeline
            .process_batch(&BatchContext::new(), vec![scan("AA", vec![], 1)])
            .unwrap_err();
        assert!(matches!(failure.error, RadarError::StoreUnavailable { .. }));
        assert!(failure.is_retryable());
        assert_eq!(failure.scans.len(), 1);
    }

    #[test]
    fn test_retry_counts_each_scan_once() {
        let (store, pipeline) = pipeline();
        store.limit_device_writes(1);

        let failure = pipeline
            .process_batch(
                &BatchContext::new(),
                vec![scan("AA", vec![], 1_000), scan("BB", vec![], 1_000)],
            )
            .unwrap_err();
        assert_eq!(failure.scans.len(), 1);
        assert_eq!(failure.scans[0].address, "BB");
        assert_eq!(failure.unmatched.len(), 1);
        assert_eq!(failure.unmatched[0].address, "AA");

        store.limit_device_writes(usize::MAX);
        pipeline
            .process_batch(&BatchContext::new(), failure.scans)
            .unwrap();
        for address in ["AA", "BB"] {
            assert_eq!(store.get_device(address).unwrap().unwrap().detect_count, 1);
        }
    }
}
