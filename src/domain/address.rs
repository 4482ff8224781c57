//! Manufacturer addresses
//!
//! The registry is reached through an EVM JSON-RPC relay, but operators and
//! the admin UI identify manufacturers by Hedera account id (`0.0.1234`).
//! Both forms are accepted and normalized here.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Reasons an address string is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is required")]
    Empty,

    #[error("invalid Hedera account id: {0}")]
    InvalidAccountId(String),

    #[error("invalid EVM address: {0}")]
    InvalidEvmAddress(String),
}

/// A manufacturer identity as understood by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManufacturerAddress {
    /// Hedera account id `shard.realm.num`
    Account { shard: u32, realm: u64, num: u64 },
    /// Raw 20-byte EVM address
    Evm([u8; 20]),
}

impl ManufacturerAddress {
    /// Parse and normalize a user-supplied address.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(hex_part) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            if hex_part.len() != 40 {
                return Err(AddressError::InvalidEvmAddress(raw.to_string()));
            }
            let bytes = hex::decode(hex_part)
                .map_err(|_| AddressError::InvalidEvmAddress(raw.to_string()))?;
            let mut out = [0u8; 20];
            out.copy_from_slice(&bytes);
            return Ok(Self::Evm(out));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(AddressError::InvalidAccountId(raw.to_string()));
        }
        if parts
            .iter()
            .any(|p| !p.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(AddressError::InvalidAccountId(raw.to_string()));
        }

        let invalid = || AddressError::InvalidAccountId(raw.to_string());
        let shard = parts[0].parse::<u32>().map_err(|_| invalid())?;
        let realm = parts[1].parse::<u64>().map_err(|_| invalid())?;
        let num = parts[2].parse::<u64>().map_err(|_| invalid())?;

        Ok(Self::Account { shard, realm, num })
    }

    /// EVM form of this address.
    ///
    /// Account ids use the long-zero encoding: shard (4 bytes), realm
    /// (8 bytes) and account number (8 bytes), all big-endian.
    pub fn to_evm_bytes(&self) -> [u8; 20] {
        match self {
            Self::Evm(bytes) => *bytes,
            Self::Account { shard, realm, num } => {
                let mut out = [0u8; 20];
                out[..4].copy_from_slice(&shard.to_be_bytes());
                out[4..12].copy_from_slice(&realm.to_be_bytes());
                out[12..].copy_from_slice(&num.to_be_bytes());
                out
            }
        }
    }

    /// Ordering key for provenance events about this manufacturer.
    pub fn subject_key(&self) -> String {
        format!("manufacturer/{}", self)
    }
}

impl fmt::Display for ManufacturerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account { shard, realm, num } => write!(f, "{}.{}.{}", shard, realm, num),
            Self::Evm(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

impl FromStr for ManufacturerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ManufacturerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ManufacturerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
