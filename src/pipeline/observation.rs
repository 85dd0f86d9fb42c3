//! Scanner input and decoded observations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decoder::frame::decode_frame;
use crate::decoder::manufacturer::ManufacturerResolver;
use crate::error::DecodeIssue;
use crate::logging::structured::LogContext;
use crate::storage::models::{DeviceMetadata, ManufacturerInfo};

/// One advertisement as delivered by the scanner, with its out-of-band data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawScan {
    pub address: String,
    /// Advertisement payload (length-prefixed AD structures).
    pub raw: Vec<u8>,
    pub rssi: Option<i16>,
    /// Name reported by the radio stack, used when the payload carries none.
    pub name: Option<String>,
    pub is_connectable: bool,
    pub is_paired: bool,
    pub address_type: Option<u8>,
    pub device_class: Option<u32>,
    pub timestamp_ms: i64,
    /// Fetched device descriptor, as a JSON blob.
    pub metadata_json: Option<String>,
}

/// A decoded scan. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObservation {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i8>,
    pub manufacturer: Option<ManufacturerInfo>,
    pub service_uuids: Vec<Uuid>,
    pub raw: Vec<u8>,
    pub is_connectable: bool,
    pub is_paired: bool,
    pub address_type: Option<u8>,
    pub device_class: Option<u32>,
    pub timestamp_ms: i64,
    pub metadata: Option<DeviceMetadata>,
    /// Conditions absorbed while decoding.
    pub issues: Vec<DecodeIssue>,
}

impl DeviceObservation {
    /// Decode a scan. Never fails; malformed input yields fewer fields and
    /// an entry in `issues`.
    pub fn decode(scan: RawScan, resolver: &ManufacturerResolver, ctx: &LogContext) -> Self {
        let frame = decode_frame(&scan.raw);
        let mut issues = Vec::new();

        if let Some(issue) = frame.truncated.clone() {
            if let DecodeIssue::TruncatedFrame {
                offset,
                declared,
                available,
            } = &issue
            {
                crate::log_warn!(
                    ctx,
                    "FRAME_TRUNCATED",
                    offset = offset,
                    declared = declared,
                    available = available,
                    raw = hex::encode(&scan.raw)
                );
            }
            issues.push(issue);
        }

        let manufacturer = frame.manufacturer_data().map(|(company_id, payload)| {
            let resolution = resolver.resolve(company_id, payload, scan.timestamp_ms);
            if let Some(issue) = resolution.issue {
                crate::log_warn!(ctx, "VENDOR_PAYLOAD_MALFORMED", issue = issue.to_string());
                issues.push(issue);
            }
            ManufacturerInfo {
                id: resolution.manufacturer.id(),
                name: resolution.manufacturer.name().map(str::to_string),
                airdrop: resolution.airdrop,
            }
        });

        let name = frame
            .local_name()
            .map(str::to_string)
            .or_else(|| scan.name.clone().filter(|n| !n.is_empty()));

        let metadata = scan
            .metadata_json
            .as_deref()
            .and_then(DeviceMetadata::from_json_lossy);

        log::debug!(
            "{} OBSERVATION_DECODED records={} manufacturer={:?}",
            ctx,
            frame.records.len(),
            manufacturer.as_ref().map(|m| m.id)
        );

        Self {
            name,
            tx_power: frame.tx_power(),
            service_uuids: frame.service_uuids(),
            manufacturer,
            metadata,
            issues,
            address: scan.address,
            rssi: scan.rssi,
            raw: scan.raw,
            is_connectable: scan.is_connectable,
            is_paired: scan.is_paired,
            address_type: scan.address_type,
            device_class: scan.device_class,
            timestamp_ms: scan.timestamp_ms,
        }
    }
}
