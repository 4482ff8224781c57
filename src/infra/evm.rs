//! EVM contract adapters for the registry and token service
//!
//! Both contracts are reached through a JSON-RPC endpoint (the Hedera
//! JSON-RPC relay in production). Mutations are signed by the operator key
//! and wait for the transaction receipt.

use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use tracing::info;

use crate::domain::{ManufacturerAddress, TokenId, TxHash};

use super::traits::{Registry, TokenService};
use super::ServiceError;

sol! {
    #[sol(rpc)]
    interface IManufacturerVerifier {
        function isVerifiedManufacturer(address manufacturer) external view returns (bool);

        function verifyManufacturer(address manufacturer) external;

        function revokeManufacturer(address manufacturer) external;
    }
}

sol! {
    #[sol(rpc)]
    interface IDrugToken {
        function mintDrugToken(string drugName, string batchId) external returns (uint256);

        function tokenOfBatch(string batchId) external view returns (uint256);
    }
}

/// Chain access configuration
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// ManufacturerVerifier contract
    pub registry_address: Address,
    /// DrugToken contract
    pub token_address: Address,
    /// Operator key signing registry and mint transactions
    pub private_key: String,
    pub chain_id: u64,
}

impl ChainConfig {
    /// Load from the environment; `None` unless every required variable is set.
    pub fn from_env() -> Option<Self> {
        let rpc_url = std::env::var("HEDERA_RPC").ok()?;
        let registry_address = std::env::var("REGISTRY_CONTRACT_ADDRESS")
            .ok()
            .and_then(|s| s.parse().ok())?;
        let token_address = std::env::var("TOKEN_CONTRACT_ADDRESS")
            .ok()
            .and_then(|s| s.parse().ok())?;
        let private_key = std::env::var("OPERATOR_PRIVATE_KEY").ok()?;
        let chain_id = std::env::var("CHAIN_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(296);

        Some(Self {
            rpc_url,
            registry_address,
            token_address,
            private_key,
            chain_id,
        })
    }

    fn signer(&self) -> Result<PrivateKeySigner, ServiceError> {
        self.private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| ServiceError::Rejected(format!("Invalid private key: {}", e)))
    }
}

fn invalid_url(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::Rejected(format!("Invalid RPC URL: {}", err))
}

/// Reverts are the contract refusing the call; anything else is transport.
fn classify(err: impl std::fmt::Display) -> ServiceError {
    let message = err.to_string();
    if message.contains("revert") {
        ServiceError::Rejected(message)
    } else {
        ServiceError::Unavailable(message)
    }
}

fn evm_address(address: &ManufacturerAddress) -> Address {
    Address::from_slice(&address.to_evm_bytes())
}

/// Registry backed by the ManufacturerVerifier contract
pub struct EvmRegistry {
    config: ChainConfig,
}

impl EvmRegistry {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }

    async fn send_mutation(
        &self,
        address: &ManufacturerAddress,
        verify: bool,
    ) -> Result<TxHash, ServiceError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(alloy::network::EthereumWallet::from(self.config.signer()?))
            .on_http(self.config.rpc_url.parse().map_err(invalid_url)?);

        let contract = IManufacturerVerifier::new(self.config.registry_address, &provider);
        let manufacturer = evm_address(address);

        let verify_call = contract.verifyManufacturer(manufacturer);
        let revoke_call = contract.revokeManufacturer(manufacturer);
        let pending = if verify {
            verify_call.send().await.map_err(classify)?
        } else {
            revoke_call.send().await.map_err(classify)?
        };

        let receipt = pending.get_receipt().await.map_err(classify)?;
        if !receipt.status() {
            return Err(ServiceError::Rejected(format!(
                "transaction {} reverted",
                receipt.transaction_hash
            )));
        }

        let tx_hash = TxHash::from_bytes(receipt.transaction_hash.as_slice());
        info!(
            address = %address,
            tx_hash = %tx_hash,
            block = receipt.block_number.unwrap_or(0),
            verify,
            "Registry mutation confirmed"
        );
        Ok(tx_hash)
    }
}

#[async_trait]
impl Registry for EvmRegistry {
    async fn is_verified_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<bool, ServiceError> {
        let provider = ProviderBuilder::new().on_http(self.config.rpc_url.parse().map_err(invalid_url)?);
        let contract = IManufacturerVerifier::new(self.config.registry_address, &provider);

        let result = contract
            .isVerifiedManufacturer(evm_address(address))
            .call()
            .await
            .map_err(classify)?;
        Ok(result._0)
    }

    async fn verify_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<TxHash, ServiceError> {
        self.send_mutation(address, true).await
    }

    async fn revoke_manufacturer(
        &self,
        address: &ManufacturerAddress,
    ) -> Result<TxHash, ServiceError> {
        self.send_mutation(address, false).await
    }
}

/// Token service backed by the DrugToken contract
pub struct EvmTokenService {
    config: ChainConfig,
}

impl EvmTokenService {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TokenService for EvmTokenService {
    async fn mint(&self, drug_name: &str, batch_id: &str) -> Result<TokenId, ServiceError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(alloy::network::EthereumWallet::from(self.config.signer()?))
            .on_http(self.config.rpc_url.parse().map_err(invalid_url)?);

        let contract = IDrugToken::new(self.config.token_address, &provider);
        let call = contract.mintDrugToken(drug_name.to_string(), batch_id.to_string());
        let pending = call.send().await.map_err(classify)?;
        let receipt = pending.get_receipt().await.map_err(classify)?;
        if !receipt.status() {
            return Err(ServiceError::Rejected(format!(
                "mint transaction {} reverted",
                receipt.transaction_hash
            )));
        }

        // The mint's return value is not in the receipt; read it back.
        let token = self
            .token_for_batch(batch_id)
            .await?
            .ok_or_else(|| ServiceError::Unavailable("minted token not yet visible".to_string()))?;

        info!(
            batch_id = batch_id,
            token_id = %token,
            tx_hash = %receipt.transaction_hash,
            "Drug token minted"
        );
        Ok(token)
    }

    async fn token_for_batch(&self, batch_id: &str) -> Result<Option<TokenId>, ServiceError> {
        let provider = ProviderBuilder::new().on_http(self.config.rpc_url.parse().map_err(invalid_url)?);
        let contract = IDrugToken::new(self.config.token_address, &provider);

        let result = contract
            .tokenOfBatch(batch_id.to_string())
            .call()
            .await
            .map_err(classify)?;

        if result._0 == U256::ZERO {
            Ok(None)
        } else {
            Ok(Some(TokenId::new(result._0.to_string())))
        }
    }
}
