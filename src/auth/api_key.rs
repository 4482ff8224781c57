//! API key authentication
//!
//! Keys are formatted as `trx_<random>`. Only their SHA-256 hashes are kept.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use sha2::{Digest, Sha256};

use super::{AuthContext, AuthError, Role};

/// API key prefix
pub const API_KEY_PREFIX: &str = "trx_";

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    /// Hash of the API key (never store plaintext)
    pub key_hash: String,
    pub role: Role,
    pub active: bool,
}

impl ApiKeyRecord {
    pub fn new(plaintext_key: &str, role: Role) -> Self {
        Self {
            key_hash: ApiKeyValidator::hash_key(plaintext_key),
            role,
            active: true,
        }
    }
}

/// In-memory API key registry
pub struct ApiKeyValidator {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyValidator {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Keys from `REGULATOR_API_KEY` and `MANUFACTURER_API_KEYS`.
    pub fn from_env() -> Self {
        let validator = Self::new();

        if let Ok(key) = std::env::var("REGULATOR_API_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                validator.register_key(ApiKeyRecord::new(key, Role::Regulator));
            }
        }

        if let Ok(keys) = std::env::var("MANUFACTURER_API_KEYS") {
            for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                validator.register_key(ApiKeyRecord::new(key, Role::Manufacturer));
            }
        }

        validator
    }

    /// Generate a new API key
    ///
    /// Returns (plaintext_key, key_hash)
    pub fn generate_key() -> (String, String) {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let random_bytes: [u8; 24] = rng.gen();
        let random_part = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        );

        let plaintext_key = format!("{}{}", API_KEY_PREFIX, random_part);
        let key_hash = Self::hash_key(&plaintext_key);

        (plaintext_key, key_hash)
    }

    /// Hash an API key for storage
    pub fn hash_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn register_key(&self, record: ApiKeyRecord) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.insert(record.key_hash.clone(), record);
    }

    /// Number of active keys
    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.active)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate an API key and return auth context
    pub fn validate(&self, key: &str) -> Result<AuthContext, AuthError> {
        if !key.starts_with(API_KEY_PREFIX) {
            return Err(AuthError::InvalidApiKey);
        }

        let key_hash = Self::hash_key(key);

        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let record = keys.get(&key_hash).ok_or(AuthError::InvalidApiKey)?;

        if !record.active {
            return Err(AuthError::InvalidApiKey);
        }

        Ok(AuthContext {
            key_id: key_hash[..12].to_string(),
            role: record.role,
        })
    }

    pub fn revoke(&self, key_hash: &str) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = keys.get_mut(key_hash) {
            record.active = false;
        }
    }
}

impl Default for ApiKeyValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key() {
        let (key, hash) = ApiKeyValidator::generate_key();

        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_validate_key_carries_role() {
        let validator = ApiKeyValidator::new();
        let (key, _) = ApiKeyValidator::generate_key();
        validator.register_key(ApiKeyRecord::new(&key, Role::Manufacturer));

        let context = validator.validate(&key).unwrap();
        assert_eq!(context.role, Role::Manufacturer);
        assert!(context.can_upload());
        assert!(!context.is_regulator());
        assert_eq!(context.key_id.len(), 12);
    }

    #[test]
    fn test_invalid_key() {
        let validator = ApiKeyValidator::new();
        assert_eq!(validator.validate("invalid_key"), Err(AuthError::InvalidApiKey));
        assert_eq!(validator.validate("trx_unknown"), Err(AuthError::InvalidApiKey));
    }

    #[test]
    fn test_revoked_key() {
        let validator = ApiKeyValidator::new();
        let (key, hash) = ApiKeyValidator::generate_key();
        validator.register_key(ApiKeyRecord::new(&key, Role::Regulator));

        assert!(validator.validate(&key).is_ok());
        assert_eq!(validator.len(), 1);

        validator.revoke(&hash);

        assert!(validator.validate(&key).is_err());
        assert!(validator.is_empty());
    }
}
