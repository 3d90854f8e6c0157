//! Coinbase Developer Platform server-wallet adapter.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;

use super::managed::{Provisioned, expect_json, lock, transport_err};
use super::{AdapterError, SignRequest, WalletAdapter, parse_address};
use crate::proto::typed_data_json;
use crate::store::AdapterConfig;

const PROVIDER: &str = "coinbase-cdp";
const API_BASE: &str = "https://api.cdp.coinbase.com/platform/v2/evm";

/// Delegates custody and signing to CDP's EVM account API.
pub struct CoinbaseCdpAdapter {
    api_key_id: String,
    api_key_secret: String,
    http: reqwest::Client,
    state: Mutex<Provisioned>,
}

#[derive(Deserialize)]
struct AccountResponse {
    address: Address,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

impl CoinbaseCdpAdapter {
    pub fn new(
        api_key_id: &str,
        api_key_secret: &str,
        wallet_id: Option<String>,
        address: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let address = address.map(parse_address).transpose()?;
        Ok(CoinbaseCdpAdapter {
            api_key_id: api_key_id.to_string(),
            api_key_secret: api_key_secret.to_string(),
            http: reqwest::Client::new(),
            state: Mutex::new(Provisioned { wallet_id, address }),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{API_BASE}{path}"))
            .bearer_auth(&self.api_key_secret)
            .header("x-api-key-id", self.api_key_id.as_str())
    }
}

#[async_trait]
impl WalletAdapter for CoinbaseCdpAdapter {
    async fn provision(&self) -> Result<Address, AdapterError> {
        if let Some(address) = lock(&self.state).address {
            return Ok(address);
        }
        let response = self
            .request(reqwest::Method::POST, "/accounts")
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| transport_err(PROVIDER, e))?;
        let account: AccountResponse = expect_json(PROVIDER, response).await?;

        let mut state = lock(&self.state);
        state.wallet_id = Some(
            account
                .name
                .unwrap_or_else(|| account.address.to_string()),
        );
        state.address = Some(account.address);
        Ok(account.address)
    }

    fn address(&self) -> Result<Address, AdapterError> {
        lock(&self.state).address.ok_or(AdapterError::NotInitialized)
    }

    fn is_initialized(&self) -> bool {
        lock(&self.state).address.is_some()
    }

    async fn sign_typed_data(&self, request: &SignRequest) -> Result<String, AdapterError> {
        let address = self.address()?;
        let typed_data = typed_data_json(request.network, &request.authorization);
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/accounts/{address}/sign/typed-data"),
            )
            .json(&typed_data)
            .send()
            .await
            .map_err(|e| transport_err(PROVIDER, e))?;
        let signed: SignResponse = expect_json(PROVIDER, response).await?;
        Ok(signed.signature)
    }

    fn serialize(&self) -> AdapterConfig {
        let state = lock(&self.state);
        AdapterConfig::CoinbaseCdp {
            api_key_id: self.api_key_id.clone(),
            api_key_secret: self.api_key_secret.clone(),
            wallet_id: state.wallet_id.clone(),
            address: state.address.map(|a| a.to_string()),
        }
    }
}
