//! Identifier newtypes shared across the domain

use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry transaction hash (`0x`-prefixed hex as returned by the relay)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token bound to a batch by the minting service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maximum accepted batch id length
pub const MAX_BATCH_ID_LEN: usize = 64;

/// Check a batch id: non-empty, bounded, `[A-Za-z0-9._-]` only.
pub fn validate_batch_id(batch_id: &str) -> Result<(), String> {
    if batch_id.is_empty() {
        return Err("batchId is required".to_string());
    }
    if batch_id.len() > MAX_BATCH_ID_LEN {
        return Err(format!(
            "batchId exceeds {} characters",
            MAX_BATCH_ID_LEN
        ));
    }
    if let Some(c) = batch_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("batchId contains invalid character {:?}", c));
    }
    Ok(())
}
