//! Vendor sub-protocol decoding.
//!
//! The reserved vendor's manufacturer payload is a sequence of continuity
//! messages, `[type] [length] [body; length]`. The AirDrop message advertises
//! truncated SHA-256 hashes of the sender's contact identifiers (Apple ID,
//! phone, e-mails). Offsets live in [`AirDropLayout`] and the decoder is a
//! [`VendorSubframeStrategy`], so another layout or vendor can be plugged in
//! without touching the resolver.
//!
//! A malformed or truncated sub-payload yields no hashes; the condition is
//! reported as [`DecodeIssue::MalformedVendorPayload`] and never fails the
//! outer decode.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{AirDropLayout, MAX_HASH_SLOTS};
use crate::error::DecodeIssue;

/// A truncated contact identifier hash (up to 4 bytes, big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactHash(pub u32);

impl ContactHash {
    /// Hash a contact identifier the way it is advertised: the first
    /// `width` bytes of its SHA-256 digest.
    ///
    /// `width` is clamped to 1..=4.
    pub fn from_identifier(identifier: &str, width: usize) -> Self {
        let digest = Sha256::digest(identifier.as_bytes());
        let width = width.clamp(1, 4);
        ContactHash(fold_be(&digest[..width]))
    }
}

impl fmt::Display for ContactHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A contact hash seen in one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSighting {
    pub hash: ContactHash,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

/// Contact hashes advertised by one device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AirDrop {
    pub contacts: Vec<ContactSighting>,
}

impl AirDrop {
    pub fn hashes(&self) -> impl Iterator<Item = ContactHash> + '_ {
        self.contacts.iter().map(|c| c.hash)
    }
}

/// What a strategy found in a vendor payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VendorFrame {
    /// Sub-protocol version byte, when the contact message was present.
    pub version: Option<u8>,
    pub hashes: Vec<ContactHash>,
}

/// Decoder for one vendor's sub-protocol.
pub trait VendorSubframeStrategy: Send + Sync {
    /// Company identifier whose payloads this strategy understands.
    fn company_id(&self) -> u16;

    /// Extract contact hashes. `Err` carries a reason for diagnostics.
    fn extract(&self, payload: &[u8]) -> Result<VendorFrame, String>;
}

/// AirDrop contact hashes inside the continuity payload.
#[derive(Debug, Clone, Default)]
pub struct AirDropStrategy {
    layout: AirDropLayout,
}

impl AirDropStrategy {
    pub fn new(layout: AirDropLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &AirDropLayout {
        &self.layout
    }

    fn parse_message(&self, body: &[u8]) -> Result<VendorFrame, String> {
        let layout = &self.layout;
        if !(1..=4).contains(&layout.hash_width) {
            return Err(format!("unsupported hash width {}", layout.hash_width));
        }
        let needed = layout
            .min_body_len()
            .ok_or_else(|| "layout offsets overflow".to_string())?;
        if body.len() < needed {
            return Err(format!(
                "contact message has {} bytes, layout needs {}",
                body.len(),
                needed
            ));
        }

        let mut hashes = Vec::with_capacity(layout.hash_count.min(MAX_HASH_SLOTS));
        for slot in 0..layout.hash_count {
            let start = layout.hash_offset + slot * layout.hash_width;
            let value = fold_be(&body[start..start + layout.hash_width]);
            // Unset slots are zero-filled
            if value != 0 && !hashes.contains(&ContactHash(value)) {
                hashes.push(ContactHash(value));
            }
        }

        Ok(VendorFrame {
            version: Some(body[layout.version_offset]),
            hashes,
        })
    }
}

impl VendorSubframeStrategy for AirDropStrategy {
    fn company_id(&self) -> u16 {
        self.layout.company_id
    }

    fn extract(&self, payload: &[u8]) -> Result<VendorFrame, String> {
        let mut pos = 0;
        while pos < payload.len() {
            if pos + 2 > payload.len() {
                return Err(format!("dangling message header at offset {}", pos));
            }
            let message_type = payload[pos];
            let len = payload[pos + 1] as usize;
            let body_start = pos + 2;
            if body_start + len > payload.len() {
                return Err(format!(
                    "message 0x{:02X} declares {} bytes, {} available",
                    message_type,
                    len,
                    payload.len() - body_start
                ));
            }

            if message_type == self.layout.message_type {
                return self.parse_message(&payload[body_start..body_start + len]);
            }
            pos = body_start + len;
        }

        Ok(VendorFrame::default())
    }
}

/// Run a strategy and absorb failures.
///
/// Returns the contacts (absent when no contact message was found) and the
/// issue to record, if any.
pub fn decode_vendor_payload(
    strategy: &dyn VendorSubframeStrategy,
    payload: &[u8],
    timestamp_ms: i64,
) -> (Option<AirDrop>, Option<DecodeIssue>) {
    match strategy.extract(payload) {
        Ok(frame) if frame.version.is_none() && frame.hashes.is_empty() => (None, None),
        Ok(frame) => {
            let contacts = frame
                .hashes
                .into_iter()
                .map(|hash| ContactSighting {
                    hash,
                    first_seen_ms: timestamp_ms,
                    last_seen_ms: timestamp_ms,
                })
                .collect();
            (Some(AirDrop { contacts }), None)
        }
        Err(reason) => (
            None,
            Some(DecodeIssue::MalformedVendorPayload {
                company_id: strategy.company_id(),
                reason,
            }),
        ),
    }
}

fn fold_be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}
