//! Privy server-wallet adapter.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;

use super::managed::{Provisioned, expect_json, lock, transport_err};
use super::{AdapterError, SignRequest, WalletAdapter, parse_address};
use crate::proto::typed_data_json;
use crate::store::AdapterConfig;

const PROVIDER: &str = "privy";
const API_BASE: &str = "https://api.privy.io/v1";

/// Delegates custody and signing to Privy's wallet API, authenticated with
/// the app id/secret pair.
pub struct PrivyAdapter {
    app_id: String,
    app_secret: String,
    http: reqwest::Client,
    state: Mutex<Provisioned>,
}

#[derive(Deserialize)]
struct WalletResponse {
    id: String,
    address: Address,
}

#[derive(Deserialize)]
struct RpcResponse {
    data: RpcData,
}

#[derive(Deserialize)]
struct RpcData {
    signature: String,
}

impl PrivyAdapter {
    pub fn new(
        app_id: &str,
        app_secret: &str,
        wallet_id: Option<String>,
        address: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let address = address.map(parse_address).transpose()?;
        Ok(PrivyAdapter {
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            http: reqwest::Client::new(),
            state: Mutex::new(Provisioned { wallet_id, address }),
        })
    }
}

#[async_trait]
impl WalletAdapter for PrivyAdapter {
    async fn provision(&self) -> Result<Address, AdapterError> {
        if let Some(address) = lock(&self.state).address {
            return Ok(address);
        }
        let response = self
            .http
            .post(format!("{API_BASE}/wallets"))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .header("privy-app-id", self.app_id.as_str())
            .json(&json!({ "chain_type": "ethereum" }))
            .send()
            .await
            .map_err(|e| transport_err(PROVIDER, e))?;
        let wallet: WalletResponse = expect_json(PROVIDER, response).await?;

        let mut state = lock(&self.state);
        state.wallet_id = Some(wallet.id);
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
            .post(format!("{API_BASE}/wallets/{wallet_id}/rpc"))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .header("privy-app-id", self.app_id.as_str())
            .json(&json!({
                "method": "eth_signTypedData_v4",
                "params": { "typed_data": typed_data },
            }))
            .send()
            .await
            .map_err(|e| transport_err(PROVIDER, e))?;
        let signed: RpcResponse = expect_json(PROVIDER, response).await?;
        Ok(signed.data.signature)
    }

    fn serialize(&self) -> AdapterConfig {
        let state = lock(&self.state);
        AdapterConfig::Privy {
            app_id: self.app_id.clone(),
            app_secret: self.app_secret.clone(),
            wallet_id: state.wallet_id.clone(),
            address: state.address.map(|a| a.to_string()),
        }
    }
}
