//! Pushes level changes to the on-chain risk registry.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::keccak256;
use tokio::sync::Mutex;

use crate::config::SinkConfig;
use crate::core::{Market, RiskLevel};
use crate::error::ChainSubmitError;

abigen!(
    RiskMonitor,
    r#"[
        function updateRisk(bytes32 marketId, uint8 level) external
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Anything that can record a market's current level.
#[async_trait]
pub trait RiskSink: Send + Sync {
    /// Returns the submitted transaction hash.
    async fn update_risk(&self, market: &Market, level: RiskLevel) -> Result<String, ChainSubmitError>;
}

/// On-chain market id: keccak256 of the market label.
pub fn market_key(label: &str) -> [u8; 32] {
    keccak256(label.as_bytes())
}

pub struct ContractSink {
    contract: RiskMonitor<Client>,
    gas_limit: u64,
    // one signer, one nonce sequence
    submit: Mutex<()>,
}

impl ContractSink {
    pub fn new(rpc_url: &str, config: &SinkConfig) -> Result<Self, ChainSubmitError> {
        let key = config
            .private_key
            .as_deref()
            .ok_or_else(|| ChainSubmitError::Signer("PRIVATE_KEY is not set".into()))?;
        let address = config
            .contract_address
            .as_deref()
            .ok_or_else(|| ChainSubmitError::Contract("no contract address configured".into()))?;

        let wallet = LocalWallet::from_str(key.trim_start_matches("0x"))
            .map_err(|e| ChainSubmitError::Signer(e.to_string()))?
            .with_chain_id(config.chain_id);
        let provider =
            Provider::<Http>::try_from(rpc_url).map_err(|e| ChainSubmitError::Provider(e.to_string()))?;
        let address = Address::from_str(address).map_err(|e| ChainSubmitError::Contract(e.to_string()))?;

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        Ok(Self {
            contract: RiskMonitor::new(address, client),
            gas_limit: config.gas_limit,
            submit: Mutex::new(()),
        })
    }

    /// Account the updates are signed with.
    pub fn sender(&self) -> Address {
        self.contract.client().address()
    }

    pub fn contract_address(&self) -> Address {
        self.contract.address()
    }
}

#[async_trait]
impl RiskSink for ContractSink {
    async fn update_risk(&self, market: &Market, level: RiskLevel) -> Result<String, ChainSubmitError> {
        let _submit = self.submit.lock().await;
        let call = self
            .contract
            .update_risk(market_key(&market.label), level.as_u8())
            .gas(self.gas_limit);
        let pending = call
            .send()
            .await
            .map_err(|e| ChainSubmitError::Contract(e.to_string()))?;
        let tx_hash = format!("{:?}", pending.tx_hash());
        tracing::info!(market = %market.label, level = level.as_u8(), %tx_hash, "updateRisk submitted");
        Ok(tx_hash)
    }
}
