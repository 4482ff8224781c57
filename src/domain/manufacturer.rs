//! Manufacturer authorization records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{EventDraft, ManufacturerAddress, TxHash};

/// Locally cached authorization state of a manufacturer.
///
/// The registry is the source of truth; this record mirrors the last
/// mutation made through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManufacturerStatus {
    #[default]
    Unknown,
    Verified,
    Revoked,
}

impl ManufacturerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManufacturerStatus::Unknown => "unknown",
            ManufacturerStatus::Verified => "verified",
            ManufacturerStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for ManufacturerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manufacturer record, keyed by address. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturerRecord {
    pub address: ManufacturerAddress,
    pub status: ManufacturerStatus,
    pub verified_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_tx_hash: Option<TxHash>,
    pub updated_at: DateTime<Utc>,
}

impl ManufacturerRecord {
    pub fn new(address: ManufacturerAddress) -> Self {
        Self {
            address,
            status: ManufacturerStatus::Unknown,
            verified_at: None,
            revoked_at: None,
            last_tx_hash: None,
            updated_at: Utc::now(),
        }
    }

    /// Verify is valid from every state, including a prior revocation.
    pub fn apply_verified(&mut self, tx_hash: TxHash, at: DateTime<Utc>) {
        self.status = ManufacturerStatus::Verified;
        self.verified_at = Some(at);
        self.last_tx_hash = Some(tx_hash);
        self.updated_at = at;
    }

    pub fn apply_revoked(&mut self, tx_hash: TxHash, at: DateTime<Utc>) {
        self.status = ManufacturerStatus::Revoked;
        self.revoked_at = Some(at);
        self.last_tx_hash = Some(tx_hash);
        self.updated_at = at;
    }

    /// Provenance event for the last mutation applied to this record.
    pub fn last_event(&self) -> Option<EventDraft> {
        let tx_hash = self.last_tx_hash.as_ref()?;
        match self.status {
            ManufacturerStatus::Verified => {
                Some(EventDraft::manufacturer_verified(&self.address, tx_hash))
            }
            ManufacturerStatus::Revoked => {
                Some(EventDraft::manufacturer_revoked(&self.address, tx_hash))
            }
            ManufacturerStatus::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_revoke_cycle() {
        let addr = ManufacturerAddress::parse("0.0.111").unwrap();
        let mut record = ManufacturerRecord::new(addr);
        assert_eq!(record.status, ManufacturerStatus::Unknown);

        let t1 = Utc::now();
        record.apply_verified(TxHash::new("0x01"), t1);
        assert_eq!(record.status, ManufacturerStatus::Verified);
        assert_eq!(record.verified_at, Some(t1));

        let t2 = Utc::now();
        record.apply_revoked(TxHash::new("0x02"), t2);
        assert_eq!(record.status, ManufacturerStatus::Revoked);
        assert_eq!(record.revoked_at, Some(t2));
        assert_eq!(record.verified_at, Some(t1));

        record.apply_verified(TxHash::new("0x03"), Utc::now());
        assert_eq!(record.status, ManufacturerStatus::Verified);
        assert_eq!(record.last_tx_hash, Some(TxHash::new("0x03")));
    }

    #[test]
    fn test_last_event_follows_last_mutation() {
        let addr = ManufacturerAddress::parse("0.0.111").unwrap();
        let mut record = ManufacturerRecord::new(addr);
        assert!(record.last_event().is_none());

        record.apply_verified(TxHash::new("0x01"), Utc::now());
        let verified = record.last_event().unwrap();
        assert_eq!(verified, EventDraft::manufacturer_verified(&addr, &TxHash::new("0x01")));

        record.apply_revoked(TxHash::new("0x02"), Utc::now());
        let revoked = record.last_event().unwrap();
        assert_eq!(revoked, EventDraft::manufacturer_revoked(&addr, &TxHash::new("0x02")));
        assert_ne!(
            verified.idempotency_key().unwrap(),
            revoked.idempotency_key().unwrap()
        );
    }

    #[test]
    fn test_serializes_camel_case() {
        let addr = ManufacturerAddress::parse("0.0.7").unwrap();
        let json = serde_json::to_value(ManufacturerRecord::new(addr)).unwrap();
        assert_eq!(json["address"], "0.0.7");
        assert_eq!(json["status"], "unknown");
        assert!(json.get("verifiedAt").is_some());
        assert!(json.get("lastTxHash").is_some());
    }
}
