//! Externally-signing adapter: the key lives in a connected browser wallet.

use alloy_primitives::Address;
use async_trait::async_trait;

use super::{AdapterError, SignRequest, WalletAdapter, parse_address};
use crate::store::AdapterConfig;

/// Holds only an address. Every signing request is refused so callers fall
/// back to the two-phase prepare/complete flow, where the browser supplies
/// the signature.
pub struct BrowserAdapter {
    address: Address,
}

impl BrowserAdapter {
    pub fn from_address(address: &str) -> Result<Self, AdapterError> {
        Ok(BrowserAdapter {
            address: parse_address(address)?,
        })
    }
}

#[async_trait]
impl WalletAdapter for BrowserAdapter {
    async fn provision(&self) -> Result<Address, AdapterError> {
        Ok(self.address)
    }

    fn address(&self) -> Result<Address, AdapterError> {
        Ok(self.address)
    }

    fn is_initialized(&self) -> bool {
        true
    }

    async fn sign_typed_data(&self, _request: &SignRequest) -> Result<String, AdapterError> {
        Err(AdapterError::MustSignClientSide)
    }

    fn serialize(&self) -> AdapterConfig {
        AdapterConfig::Browser {
            address: self.address.to_string(),
        }
    }
}
