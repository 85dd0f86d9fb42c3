//! Pipeline configuration.
//!
//! Values come from the embedding host as JSON, from the environment, or from
//! defaults. Every field has a default so partial documents are accepted.

use serde::{Deserialize, Serialize};

use crate::error::RadarError;

/// Bluetooth SIG company identifier of the reserved vendor.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Largest continuity message body; the length field is one byte.
pub const MAX_MESSAGE_LEN: usize = 255;
/// Upper bound on hash slots in one contact message.
pub const MAX_HASH_SLOTS: usize = 16;

const ENV_SHARD_COUNT: &str = "RADAR_SHARD_COUNT";
const ENV_QUEUE_CAPACITY: &str = "RADAR_QUEUE_CAPACITY";
const ENV_FILTER_CHUNK_SIZE: &str = "RADAR_FILTER_CHUNK_SIZE";

/// Byte layout of the AirDrop message inside the vendor's continuity
/// payload. Kept as data so a revised layout does not need a code change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AirDropLayout {
    pub company_id: u16,
    /// Continuity message type carrying the contact hashes.
    pub message_type: u8,
    /// Offset of the version byte within the message body.
    pub version_offset: usize,
    /// Offset of the first hash within the message body.
    pub hash_offset: usize,
    /// Width of one truncated hash in bytes (1..=4).
    pub hash_width: usize,
    pub hash_count: usize,
}

impl Default for AirDropLayout {
    fn default() -> Self {
        Self {
            company_id: APPLE_COMPANY_ID,
            message_type: 0x05,
            version_offset: 8,
            hash_offset: 9,
            hash_width: 2,
            hash_count: 4,
        }
    }
}

impl AirDropLayout {
    /// Minimum message body length needed to read every hash slot, or
    /// `None` when the layout overflows.
    pub fn min_body_len(&self) -> Option<usize> {
        let hashes_end = self
            .hash_width
            .checked_mul(self.hash_count)?
            .checked_add(self.hash_offset)?;
        Some(self.version_offset.checked_add(1)?.max(hashes_end))
    }
}

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of single-writer shards; addresses are partitioned by hash.
    pub shard_count: usize,
    /// Batches that may wait behind the one in flight.
    pub queue_capacity: usize,
    /// Records per chunk when filtering a device list in parallel.
    pub filter_chunk_size: usize,
    pub airdrop: AirDropLayout,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            shard_count,
            queue_capacity: 8,
            filter_chunk_size: 100,
            airdrop: AirDropLayout::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, RadarError> {
        let config: PipelineConfig =
            serde_json::from_str(json).map_err(|e| RadarError::Config {
                message: format!("invalid pipeline config: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RADAR_*` environment variables.
    pub fn from_env() -> Result<Self, RadarError> {
        let mut config = PipelineConfig::default();
        if let Some(v) = env_usize(ENV_SHARD_COUNT)? {
            config.shard_count = v;
        }
        if let Some(v) = env_usize(ENV_QUEUE_CAPACITY)? {
            config.queue_capacity = v;
        }
        if let Some(v) = env_usize(ENV_FILTER_CHUNK_SIZE)? {
            config.filter_chunk_size = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RadarError> {
        let fail = |message: &str| {
            Err(RadarError::Config {
                message: message.to_string(),
            })
        };
        if self.shard_count == 0 {
            return fail("shard_count must be at least 1");
        }
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1");
        }
        if self.filter_chunk_size == 0 {
            return fail("filter_chunk_size must be at least 1");
        }
        if !(1..=4).contains(&self.airdrop.hash_width) {
            return fail("airdrop.hash_width must be between 1 and 4");
        }
        if !(1..=MAX_HASH_SLOTS).contains(&self.airdrop.hash_count) {
            return fail("airdrop.hash_count must be between 1 and 16");
        }
        match self.airdrop.min_body_len() {
            Some(len) if len <= MAX_MESSAGE_LEN => {}
            _ => return fail("airdrop layout does not fit in a 255 byte message"),
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, RadarError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| RadarError::Config {
                message: format!("{}={:?}: {}", name, raw, e),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.shard_count >= 1);
        assert_eq!(config.airdrop.company_id, APPLE_COMPANY_ID);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"shard_count": 3}"#).unwrap();
        assert_eq!(config.shard_count, 3);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.airdrop.hash_width, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(PipelineConfig::from_json_str(r#"{"shard_count": 0}"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"airdrop": {"hash_width": 8}}"#).is_err());
        assert!(PipelineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_oversized_layout_rejected() {
        let huge = format!(r#"{{"airdrop": {{"hash_count": {}}}}}"#, usize::MAX);
        assert!(PipelineConfig::from_json_str(&huge).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"airdrop": {"hash_count": 0}}"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"airdrop": {"hash_offset": 250}}"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"airdrop": {"version_offset": 255}}"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"airdrop": {"hash_count": 16}}"#).is_ok());
    }

    #[test]
    fn test_min_body_len() {
        assert_eq!(AirDropLayout::default().min_body_len(), Some(17));
        let overflowing = AirDropLayout {
            hash_count: usize::MAX,
            ..Default::default()
        };
        assert_eq!(overflowing.min_body_len(), None);
    }
}
