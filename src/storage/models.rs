//! Persistent models.
//!
//! These models describe the rows the storage collaborator keeps. Column
//! layout and encodings beyond serde are the collaborator's concern.

use std::collections::BTreeSet;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decoder::vendor::{AirDrop, ContactHash, ContactSighting};
use crate::filter::predicate::Predicate;

/// Manufacturer of a device as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerInfo {
    pub id: u16,
    /// `None` when the company identifier is not in the known table.
    pub name: Option<String>,
    pub airdrop: Option<AirDrop>,
}

/// Descriptor fetched from the device by an external collaborator.
///
/// Stored as a JSON blob; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceMetadata {
    pub device_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_revision: Option<String>,
}

impl DeviceMetadata {
    /// Parse a stored blob, `None` on malformed content.
    pub fn from_json_lossy(json: &str) -> Option<Self> {
        match serde_json::from_str(json) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                log::warn!("METADATA_DECODE_FAILED error={}", e);
                None
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One row per hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    pub name: Option<String>,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub detect_count: u64,

    // User-owned fields, never touched by merging
    pub custom_name: Option<String>,
    pub favorite: bool,
    pub tags: BTreeSet<String>,

    pub manufacturer: Option<ManufacturerInfo>,
    pub rssi: Option<i16>,
    pub last_following_detection_ms: Option<i64>,
    pub address_type: Option<u8>,
    pub device_class: Option<u32>,
    pub is_paired: bool,
    pub is_connectable: bool,
    pub service_uuids: BTreeSet<Uuid>,
    /// Last raw advertisement, base64.
    pub raw_data_encoded: Option<String>,
    pub metadata: Option<DeviceMetadata>,
}

impl DeviceRecord {
    /// An empty record first seen at `time_ms`, used as a merge seed and in tests.
    pub fn new(address: &str, time_ms: i64) -> Self {
        Self {
            address: address.to_string(),
            name: None,
            first_seen_ms: time_ms,
            last_seen_ms: time_ms,
            detect_count: 1,
            custom_name: None,
            favorite: false,
            tags: BTreeSet::new(),
            manufacturer: None,
            rssi: None,
            last_following_detection_ms: None,
            address_type: None,
            device_class: None,
            is_paired: false,
            is_connectable: false,
            service_uuids: BTreeSet::new(),
            raw_data_encoded: None,
            metadata: None,
        }
    }

    /// Custom name, else the fetched device name, else the advertised name.
    pub fn resolved_name(&self) -> Option<&str> {
        self.custom_name
            .as_deref()
            .or_else(|| self.metadata.as_ref().and_then(|m| m.device_name.as_deref()))
            .or(self.name.as_deref())
    }

    pub fn manufacturer_id(&self) -> Option<u16> {
        self.manufacturer.as_ref().map(|m| m.id)
    }

    /// Contact hashes attached to this record, if any.
    pub fn contact_hashes(&self) -> impl Iterator<Item = ContactHash> + '_ {
        self.manufacturer
            .iter()
            .filter_map(|m| m.airdrop.as_ref())
            .flat_map(|a| a.hashes())
    }

    pub fn encode_raw(raw: &[u8]) -> String {
        general_purpose::STANDARD.encode(raw)
    }

    /// Decode the stored raw advertisement, `None` if absent or corrupt.
    pub fn raw_data(&self) -> Option<Vec<u8>> {
        self.raw_data_encoded
            .as_deref()
            .and_then(|s| general_purpose::STANDARD.decode(s).ok())
    }

    /// Replace the attached contacts with stored associations.
    ///
    /// Used on the read path, where the record's own manufacturer info only
    /// holds the contacts of the last advertisement.
    pub fn with_contacts(mut self, associations: &[ContactAssociation]) -> Self {
        if associations.is_empty() {
            return self;
        }
        let contacts = associations
            .iter()
            .map(|a| ContactSighting {
                hash: a.hash,
                first_seen_ms: a.first_seen_ms,
                last_seen_ms: a.last_seen_ms,
            })
            .collect();
        let airdrop = Some(AirDrop { contacts });
        match self.manufacturer.as_mut() {
            Some(info) => info.airdrop = airdrop,
            None => {
                self.manufacturer = Some(ManufacturerInfo {
                    id: crate::config::APPLE_COMPANY_ID,
                    name: crate::decoder::lookup_manufacturer(crate::config::APPLE_COMPANY_ID)
                        .name()
                        .map(str::to_string),
                    airdrop,
                })
            }
        }
        self
    }
}

/// Last known owner of a hashed contact identifier, keyed by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactAssociation {
    pub hash: ContactHash,
    pub address: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

/// A user-defined detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadarProfile {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    /// Profiles without a filter never match.
    pub detect_filter: Option<Predicate>,
    /// Zero means every match fires.
    pub cooldown_ms: u64,
}

impl RadarProfile {
    /// Decode a stored filter tree, `None` on malformed content.
    pub fn decode_filter(json: &str) -> Option<Predicate> {
        match serde_json::from_str(json) {
            Ok(filter) => Some(filter),
            Err(e) => {
                log::warn!("PROFILE_FILTER_DECODE_FAILED error={}", e);
                None
            }
        }
    }

    pub fn can_match(&self) -> bool {
        self.is_active && self.detect_filter.is_some()
    }
}

/// Append-only record of a profile firing for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDetection {
    /// Assigned by the store on append.
    pub id: Option<i64>,
    pub profile_id: i64,
    pub trigger_time_ms: i64,
    pub device_address: String,
}
