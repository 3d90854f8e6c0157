//! Crossmint custodial-wallet adapter.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;

use super::managed::{Provisioned, expect_json, lock, transport_err};
use super::{AdapterError, SignRequest, WalletAdapter, parse_address};
use crate::proto::typed_data_json;
use crate::store::AdapterConfig;

const PROVIDER: &str = "crossmint";
const API_BASE: &str = "https://www.crossmint.com/api/2022-06-09";

/// Delegates custody and signing to Crossmint's wallet API, authenticated
/// with a server-side API key.
pub struct CrossmintAdapter {
    api_key: String,
    http: reqwest::Client,
    state: Mutex<Provisioned>,
}

#[derive(Deserialize)]
struct WalletResponse {
    address: Address,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    locator: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureResponse {
    #[serde(default)]
    output_signature: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

impl CrossmintAdapter {
    pub fn new(
        api_key: &str,
        wallet_id: Option<String>,
        address: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let address = address.map(parse_address).transpose()?;
        Ok(CrossmintAdapter {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            state: Mutex::new(Provisioned { wallet_id, address }),
        })
    }
}

#[async_trait]
impl WalletAdapter for CrossmintAdapter {
    async fn provision(&self) -> Result<Address, AdapterError> {
        if let Some(address) = lock(&self.state).address {
            return Ok(address);
        }
        let response = self
            .http
            .post(format!("{API_BASE}/wallets"))
            .header("x-api-key", self.api_key.as_str())
            .json(&json!({ "type": "evm-mpc-wallet" }))
            .send()
            .await
            .map_err(|e| transport_err(PROVIDER, e))?;
        let wallet: WalletResponse = expect_json(PROVIDER, response).await?;

        let mut state = lock(&self.state);
        state.wallet_id = wallet
            .locator
            .or(wallet.id)
            .or_else(|| Some(wallet.address.to_string()));
        state.address = Some(wallet.address);
        Ok(wallet.address)
    }

    fn address(&self) -> Result<Address, AdapterError> {
        lock(&self.state).address.ok_or(AdapterError::NotInitialized)
    }

    fn is_initialized(&self) -> bool {
        lock(&self.state).address.is_some()
    }

    async fn sign_typed_data(&self, request: &SignRequest) -> Result<String, AdapterError> {
        let wallet_id = lock(&self.state)
            .wallet_id
            .clone()
            .ok_or(AdapterError::NotInitialized)?;
        let typed_data = typed_data_json(request.network, &request.authorization);
        let response = self
            .http
            .post(format!("{API_BASE}/wallets/{wallet_id}/signatures"))
            .header("x-api-key", self.api_key.as_str())
            .json(&json!({
                "type": "evm-typed-data",
                "params": { "typedData": typed_data },
            }))
            .send()
            .await
            .map_err(|e| transport_err(PROVIDER, e))?;
        let signed: SignatureResponse = expect_json(PROVIDER, response).await?;
        signed
            .output_signature
            .or(signed.signature)
            .ok_or_else(|| AdapterError::Provider {
                provider: PROVIDER,
                message: "Response carried no signature".to_string(),
            })
    }

    fn serialize(&self) -> AdapterConfig {
        let state = lock(&self.state);
        AdapterConfig::Crossmint {
            api_key: self.api_key.clone(),
            wallet_id: state.wallet_id.clone(),
            address: state.address.map(|a| a.to_string()),
        }
    }
}
