//! Advertisement frame decoding.
//!
//! An advertisement payload is a concatenation of AD structures:
//! `[length] [type] [data; length - 1]`. Decoding stops at buffer exhaustion
//! or a zero-length element. An element whose length runs past the buffer
//! stops decoding with a [`DecodeIssue::TruncatedFrame`]; everything decoded
//! before it is kept.
//!
//! Types decoded into typed records:
//!   0x01      = Flags
//!   0x02/0x03 = Incomplete/Complete list of 16-bit service UUIDs
//!   0x04/0x05 = Incomplete/Complete list of 32-bit service UUIDs
//!   0x06/0x07 = Incomplete/Complete list of 128-bit service UUIDs
//!   0x08/0x09 = Shortened/Complete local name
//!   0x0A      = Tx power level
//!   0xFF      = Manufacturer specific data (first 2 bytes = company ID, little-endian)
//!
//! Anything else is kept as [`AdRecord::Unknown`].

use uuid::Uuid;

use crate::error::DecodeIssue;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

pub const AD_FLAGS: u8 = 0x01;
pub const AD_UUID16_INCOMPLETE: u8 = 0x02;
pub const AD_UUID16_COMPLETE: u8 = 0x03;
pub const AD_UUID32_INCOMPLETE: u8 = 0x04;
pub const AD_UUID32_COMPLETE: u8 = 0x05;
pub const AD_UUID128_INCOMPLETE: u8 = 0x06;
pub const AD_UUID128_COMPLETE: u8 = 0x07;
pub const AD_NAME_SHORT: u8 = 0x08;
pub const AD_NAME_COMPLETE: u8 = 0x09;
pub const AD_TX_POWER: u8 = 0x0A;
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// One decoded AD structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdRecord {
    Flags(AdFlags),
    ServiceUuids { complete: bool, uuids: Vec<Uuid> },
    LocalName { complete: bool, name: String },
    TxPower(i8),
    ManufacturerData { company_id: u16, payload: Vec<u8> },
    /// An element this decoder does not interpret, preserved verbatim.
    Unknown { ad_type: u8, data: Vec<u8> },
}

/// The flags element bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdFlags(pub u8);

impl AdFlags {
    pub fn limited_discoverable(&self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn general_discoverable(&self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn br_edr_not_supported(&self) -> bool {
        self.0 & 0x04 != 0
    }
}

/// Result of decoding one advertisement buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedFrame {
    pub records: Vec<AdRecord>,
    /// Bytes covered by the decoded records (length bytes included).
    pub consumed: usize,
    /// Set when decoding stopped at a malformed length field.
    pub truncated: Option<DecodeIssue>,
}

impl DecodedFrame {
    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }

    /// Complete local name if present, else the shortened one.
    pub fn local_name(&self) -> Option<&str> {
        let mut shortened = None;
        for record in &self.records {
            if let AdRecord::LocalName { complete, name } = record {
                if *complete {
                    return Some(name);
                }
                shortened.get_or_insert(name.as_str());
            }
        }
        shortened
    }

    /// All advertised service UUIDs, in frame order, without duplicates.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut out: Vec<Uuid> = Vec::new();
        for record in &self.records {
            if let AdRecord::ServiceUuids { uuids, .. } = record {
                for uuid in uuids {
                    if !out.contains(uuid) {
                        out.push(*uuid);
                    }
                }
            }
        }
        out
    }

    pub fn tx_power(&self) -> Option<i8> {
        self.records.iter().find_map(|r| match r {
            AdRecord::TxPower(p) => Some(*p),
            _ => None,
        })
    }

    pub fn flags(&self) -> Option<AdFlags> {
        self.records.iter().find_map(|r| match r {
            AdRecord::Flags(f) => Some(*f),
            _ => None,
        })
    }

    /// The first manufacturer data element.
    pub fn manufacturer_data(&self) -> Option<(u16, &[u8])> {
        self.records.iter().find_map(|r| match r {
            AdRecord::ManufacturerData {
                company_id,
                payload,
            } => Some((*company_id, payload.as_slice())),
            _ => None,
        })
    }
}

/// Expand a 16- or 32-bit short UUID over the Bluetooth base UUID.
pub fn expand_short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Decode raw advertisement bytes into typed records.
///
/// Pure function of `data`: never panics, never mutates input.
pub fn decode_frame(data: &[u8]) -> DecodedFrame {
    let mut frame = DecodedFrame::default();

    let mut pos = 0;
    while pos < data.len() {
        let len = data[pos] as usize;
        if len == 0 {
            break;
        }
        if pos + 1 + len > data.len() {
            frame.truncated = Some(DecodeIssue::TruncatedFrame {
                offset: pos,
                declared: len,
                available: data.len() - pos - 1,
            });
            break;
        }

        let ad_type = data[pos + 1];
        let body = &data[pos + 2..pos + 1 + len];
        frame.records.push(decode_element(ad_type, body));

        pos += 1 + len;
        frame.consumed = pos;
    }

    frame
}

fn decode_element(ad_type: u8, body: &[u8]) -> AdRecord {
    match ad_type {
        AD_FLAGS if body.len() == 1 => AdRecord::Flags(AdFlags(body[0])),
        AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE => AdRecord::ServiceUuids {
            complete: ad_type == AD_UUID16_COMPLETE,
            uuids: body
                .chunks_exact(2)
                .map(|c| expand_short_uuid(u16::from_le_bytes([c[0], c[1]]) as u32))
                .collect(),
        },
        AD_UUID32_INCOMPLETE | AD_UUID32_COMPLETE => AdRecord::ServiceUuids {
            complete: ad_type == AD_UUID32_COMPLETE,
            uuids: body
                .chunks_exact(4)
                .map(|c| expand_short_uuid(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
        },
        AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE => AdRecord::ServiceUuids {
            complete: ad_type == AD_UUID128_COMPLETE,
            uuids: body
                .chunks_exact(16)
                .map(|c| {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(c);
                    // Transmitted little-endian
                    bytes.reverse();
                    Uuid::from_bytes(bytes)
                })
                .collect(),
        },
        AD_NAME_SHORT | AD_NAME_COMPLETE => AdRecord::LocalName {
            complete: ad_type == AD_NAME_COMPLETE,
            name: String::from_utf8_lossy(body).into_owned(),
        },
        AD_TX_POWER if body.len() == 1 => AdRecord::TxPower(body[0] as i8),
        AD_MANUFACTURER_DATA if body.len() >= 2 => AdRecord::ManufacturerData {
            company_id: u16::from_le_bytes([body[0], body[1]]),
            payload: body[2..].to_vec(),
        },
        _ => AdRecord::Unknown {
            ad_type,
            data: body.to_vec(),
        },
    }
}
