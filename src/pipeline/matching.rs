//! Matching updated records against radar profiles.
//!
//! A profile fires for a record when its filter matches and no earlier
//! detection of the same (profile, address) pair lies within the cooldown.
//! The cooldown lookup and the append happen under the pair's stripe, so two
//! shards can never both fire inside one window.

use std::sync::Arc;

use crate::error::RadarError;
use crate::filter::engine::{CompiledFilter, EvalContext};
use crate::pipeline::context::BatchContext;
use crate::pipeline::locks::StripedLocks;
use crate::storage::models::{DeviceRecord, ProfileDetection, RadarProfile};
use crate::storage::store::{DetectionStore, ProfileStore, RadarStore};

/// A profile with its filter compiled once per match call.
struct ArmedProfile<'a> {
    profile: &'a RadarProfile,
    filter: CompiledFilter,
}

pub struct MatchEngine {
    store: Arc<dyn RadarStore>,
    locks: StripedLocks,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn RadarStore>) -> Self {
        Self {
            store,
            locks: StripedLocks::default(),
        }
    }

    /// Match `records` against the store's active profiles.
    pub fn match_records(
        &self,
        ctx: &BatchContext,
        records: &[DeviceRecord],
    ) -> Result<Vec<ProfileDetection>, RadarError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let profiles = self.store.active_profiles().map_err(|e| {
            crate::log_error!(ctx.log_context(), "STORE_UNAVAILABLE", error = e.to_string());
            RadarError::from(e)
        })?;
        self.match_profiles(ctx, records, &profiles)
    }

    /// Match `records` against an explicit profile list. Inactive profiles
    /// and profiles without a filter are skipped.
    pub fn match_profiles(
        &self,
        ctx: &BatchContext,
        records: &[DeviceRecord],
        profiles: &[RadarProfile],
    ) -> Result<Vec<ProfileDetection>, RadarError> {
        let log_ctx = ctx.log_context();
        // Recency leaves are judged by observation time, like the cooldown
        let now_ms = records
            .iter()
            .map(|r| r.last_seen_ms)
            .max()
            .unwrap_or_else(|| ctx.received_ms());
        let eval_ctx = EvalContext::at(now_ms);

        let armed: Vec<ArmedProfile<'_>> = profiles
            .iter()
            .filter(|p| p.can_match())
            .filter_map(|profile| {
                profile.detect_filter.as_ref().map(|tree| ArmedProfile {
                    profile,
                    filter: CompiledFilter::compile_logged(tree, &log_ctx),
                })
            })
            .collect();

        let mut detections = Vec::new();
        for armed in &armed {
            for record in records {
                if !armed.filter.evaluate(record, &eval_ctx) {
                    continue;
                }
                if let Some(detection) = self.fire(ctx, armed.profile, record)? {
                    detections.push(detection);
                }
            }
        }

        if !detections.is_empty() {
            log::info!(
                "{} MATCH_COMPLETE records={} profiles={} detections={}",
                log_ctx,
                records.len(),
                armed.len(),
                detections.len()
            );
        }
        Ok(detections)
    }

    /// Apply the cooldown and persist a detection if it passes.
    fn fire(
        &self,
        ctx: &BatchContext,
        profile: &RadarProfile,
        record: &DeviceRecord,
    ) -> Result<Option<ProfileDetection>, RadarError> {
        let log_ctx = ctx.device_context(&record.address);
        let trigger = record.last_seen_ms;
        let _guard = self.locks.lock(&(profile.id, record.address.as_str()));

        let last = self
            .store
            .last_detection(profile.id, &record.address)
            .map_err(|e| {
                crate::log_error!(log_ctx, "STORE_UNAVAILABLE", error = e.to_string());
                RadarError::from(e)
            })?;

        if let Some(last) = last {
            if !cooldown_elapsed(last.trigger_time_ms, trigger, profile.cooldown_ms) {
                crate::log_debug!(
                    log_ctx,
                    "PROFILE_COOLDOWN_SUPPRESSED",
                    profile_id = profile.id,
                    last_ms = last.trigger_time_ms,
                    trigger_ms = trigger
                );
                return Ok(None);
            }
        }

        let detection = self
            .store
            .append_detection(&ProfileDetection {
                id: None,
                profile_id: profile.id,
                trigger_time_ms: trigger,
                device_address: record.address.clone(),
            })
            .map_err(|e| {
                crate::log_error!(log_ctx, "STORE_UNAVAILABLE", error = e.to_string());
                RadarError::from(e)
            })?;

        crate::log_info!(
            log_ctx,
            "PROFILE_MATCHED",
            profile_id = profile.id,
            profile = profile.name.as_str(),
            trigger_ms = trigger
        );
        Ok(Some(detection))
    }
}

/// Zero cooldown always fires. Otherwise at least `cooldown_ms` must separate
/// the two triggers.
pub fn cooldown_elapsed(last_ms: i64, trigger_ms: i64, cooldown_ms: u64) -> bool {
    if cooldown_ms == 0 {
        return true;
    }
    let cooldown = i64::try_from(cooldown_ms).unwrap_or(i64::MAX);
    trigger_ms.saturating_sub(last_ms) >= cooldown
}
