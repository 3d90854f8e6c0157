//! Self-custodial adapter holding a raw secp256k1 key.

use alloy_primitives::{Address, hex};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use std::sync::Mutex;

use super::{AdapterError, SignRequest, WalletAdapter};
use crate::proto::usdc_domain;
use crate::store::AdapterConfig;
use alloy_sol_types::SolStruct;

/// Signs locally with a private key kept in the state file. Provisioning
/// generates a fresh 32-byte key.
pub struct LocalKeyAdapter {
    signer: Mutex<Option<PrivateKeySigner>>,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalKeyAdapter {
    /// An adapter with no key yet; [`WalletAdapter::provision`] creates one.
    pub fn new() -> Self {
        LocalKeyAdapter {
            signer: Mutex::new(None),
        }
    }

    /// Rehydrate from a persisted hex private key.
    pub fn from_key(private_key: &str) -> Result<Self, AdapterError> {
        let signer = private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| AdapterError::InvalidConfig(format!("Bad private key: {e}")))?;
        Ok(LocalKeyAdapter {
            signer: Mutex::new(Some(signer)),
        })
    }
}

impl Default for LocalKeyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletAdapter for LocalKeyAdapter {
    async fn provision(&self) -> Result<Address, AdapterError> {
        let mut guard = lock(&self.signer);
        let signer = guard.get_or_insert_with(PrivateKeySigner::random);
        Ok(signer.address())
    }

    fn address(&self) -> Result<Address, AdapterError> {
        lock(&self.signer)
            .as_ref()
            .map(|s| s.address())
            .ok_or(AdapterError::NotInitialized)
    }

    fn is_initialized(&self) -> bool {
        lock(&self.signer).is_some()
    }

    async fn sign_typed_data(&self, request: &SignRequest) -> Result<String, AdapterError> {
        let signer = lock(&self.signer)
            .clone()
            .ok_or(AdapterError::NotInitialized)?;
        let domain = usdc_domain(request.network);
        let digest = request.authorization.eip712_signing_hash(&domain);
        let signature = signer
            .sign_hash(&digest)
            .await
            .map_err(|e| AdapterError::Signing(format!("{e}")))?;
        Ok(hex::encode_prefixed(signature.as_bytes()))
    }

    fn serialize(&self) -> AdapterConfig {
        let private_key = lock(&self.signer)
            .as_ref()
            .map(|s| hex::encode(s.to_bytes()))
            .unwrap_or_default();
        AdapterConfig::LocalKey { private_key }
    }
}
