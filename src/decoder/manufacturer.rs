//! Manufacturer resolution.
//!
//! Maps a Bluetooth SIG company identifier to a vendor name. Every code
//! resolves: codes missing from the table come back as
//! [`Manufacturer::Unknown`]. Payloads of companies with a registered
//! [`VendorSubframeStrategy`] are handed to it for contact hash extraction.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::config::AirDropLayout;
use crate::decoder::vendor::{decode_vendor_payload, AirDrop, AirDropStrategy, VendorSubframeStrategy};
use crate::error::DecodeIssue;

/// Known company identifiers (subset of the Bluetooth SIG assigned numbers).
pub static COMPANY_IDENTIFIERS: &[(u16, &str)] = &[
    (0x0000, "Ericsson Technology Licensing"),
    (0x0001, "Nokia Mobile Phones"),
    (0x0002, "Intel Corp."),
    (0x0003, "IBM Corp."),
    (0x0004, "Toshiba Corp."),
    (0x0006, "Microsoft"),
    (0x0008, "Motorola"),
    (0x0009, "Infineon Technologies AG"),
    (0x000A, "Qualcomm Technologies International, Ltd. (QTIL)"),
    (0x000D, "Texas Instruments Inc."),
    (0x000F, "Broadcom Corporation"),
    (0x001D, "Qualcomm"),
    (0x0030, "ST Microelectronics"),
    (0x0046, "MediaTek, Inc."),
    (0x004C, "Apple, Inc."),
    (0x0057, "Harman International Industries, Inc."),
    (0x0059, "Nordic Semiconductor ASA"),
    (0x0065, "HP, Inc."),
    (0x0075, "Samsung Electronics Co. Ltd."),
    (0x0078, "Nike, Inc."),
    (0x0087, "Garmin International, Inc."),
    (0x009E, "Bose Corporation"),
    (0x00C4, "LG Electronics"),
    (0x00E0, "Google"),
    (0x012D, "Sony Corporation"),
    (0x0131, "Cypress Semiconductor"),
    (0x0157, "Anhui Huami Information Technology Co., Ltd."),
    (0x0171, "Amazon.com Services, LLC"),
    (0x027D, "HUAWEI Technologies Co., Ltd."),
    (0x02E5, "Espressif Systems (Shanghai) Co., Ltd."),
    (0x038F, "Xiaomi Inc."),
    (0x0499, "Ruuvi Innovations Ltd."),
    (0x05A7, "Sonos Inc"),
];

lazy_static! {
    static ref COMPANY_TABLE: HashMap<u16, &'static str> =
        COMPANY_IDENTIFIERS.iter().copied().collect();
}

/// Result of a company identifier lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manufacturer {
    Known { id: u16, name: &'static str },
    Unknown(u16),
}

impl Manufacturer {
    pub fn id(&self) -> u16 {
        match self {
            Manufacturer::Known { id, .. } => *id,
            Manufacturer::Unknown(id) => *id,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Manufacturer::Known { name, .. } => Some(*name),
            Manufacturer::Unknown(_) => None,
        }
    }
}

/// Static lookup. Never fails.
pub fn lookup_manufacturer(id: u16) -> Manufacturer {
    match COMPANY_TABLE.get(&id) {
        Some(name) => Manufacturer::Known { id, name: *name },
        None => Manufacturer::Unknown(id),
    }
}

/// Manufacturer plus whatever the vendor sub-decoder extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub manufacturer: Manufacturer,
    pub airdrop: Option<AirDrop>,
    pub issue: Option<DecodeIssue>,
}

/// Resolves manufacturer data elements, delegating registered vendor
/// payloads to their sub-protocol strategy.
pub struct ManufacturerResolver {
    strategies: Vec<Box<dyn VendorSubframeStrategy>>,
}

impl Default for ManufacturerResolver {
    fn default() -> Self {
        Self::new(AirDropLayout::default())
    }
}

impl ManufacturerResolver {
    /// Resolver with the AirDrop strategy registered under `layout`.
    pub fn new(layout: AirDropLayout) -> Self {
        Self {
            strategies: vec![Box::new(AirDropStrategy::new(layout))],
        }
    }

    /// Resolver with no vendor strategies.
    pub fn without_strategies() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Register a strategy; it replaces any existing one for the same company.
    pub fn register(&mut self, strategy: Box<dyn VendorSubframeStrategy>) {
        let company_id = strategy.company_id();
        self.strategies.retain(|s| s.company_id() != company_id);
        self.strategies.push(strategy);
    }

    pub fn resolve(&self, company_id: u16, payload: &[u8], timestamp_ms: i64) -> Resolution {
        let manufacturer = lookup_manufacturer(company_id);

        let strategy = self
            .strategies
            .iter()
            .find(|s| s.company_id() == company_id);

        let (airdrop, issue) = match strategy {
            Some(strategy) => decode_vendor_payload(strategy.as_ref(), payload, timestamp_ms),
            None => (None, None),
        };

        Resolution {
            manufacturer,
            airdrop,
            issue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::vendor::{ContactHash, VendorFrame};

    #[test]
    fn test_known_and_unknown() {
        assert_eq!(
            lookup_manufacturer(0x004C),
            Manufacturer::Known {
                id: 0x004C,
                name: "Apple, Inc."
            }
        );
        let unknown = lookup_manufacturer(0xFFFE);
        assert_eq!(unknown, Manufacturer::Unknown(0xFFFE));
        assert_eq!(unknown.id(), 0xFFFE);
        assert_eq!(unknown.name(), None);
    }

    #[test]
    fn test_table_has_no_duplicate_ids() {
        assert_eq!(COMPANY_TABLE.len(), COMPANY_IDENTIFIERS.len());
    }

    #[test]
    fn test_non_vendor_payload_not_decoded() {
        let resolver = ManufacturerResolver::default();
        let resolution = resolver.resolve(0x0075, &[0x05, 0x01], 0);
        assert_eq!(resolution.manufacturer.name(), Some("Samsung Electronics Co. Ltd."));
        assert!(resolution.airdrop.is_none());
        assert!(resolution.issue.is_none());
    }

    #[test]
    fn test_vendor_payload_malformed_is_absorbed() {
        let resolver = ManufacturerResolver::default();
        let resolution = resolver.resolve(0x004C, &[0x10, 0x5A], 0);
        assert_eq!(resolution.manufacturer.id(), 0x004C);
        assert!(resolution.airdrop.is_none());
        assert!(resolution.issue.is_some());
    }

    struct FixedStrategy;

    impl VendorSubframeStrategy for FixedStrategy {
        fn company_id(&self) -> u16 {
            0x0059
        }

        fn extract(&self, _payload: &[u8]) -> Result<VendorFrame, String> {
            Ok(VendorFrame {
                version: Some(1),
                hashes: vec![ContactHash(7)],
            })
        }
    }

    #[test]
    fn test_register_custom_strategy() {
        let mut resolver = ManufacturerResolver::without_strategies();
        resolver.register(Box::new(FixedStrategy));
        let resolution = resolver.resolve(0x0059, &[], 42);
        let airdrop = resolution.airdrop.unwrap();
        assert_eq!(airdrop.contacts[0].hash, ContactHash(7));
        assert_eq!(airdrop.contacts[0].first_seen_ms, 42);
    }
}
