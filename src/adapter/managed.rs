//! Shared plumbing for managed-provider adapters.

use alloy_primitives::Address;
use serde::de::DeserializeOwned;
use std::sync::Mutex;

use super::AdapterError;

/// Provider-side wallet identity learned during provisioning.
#[derive(Debug, Clone, Default)]
pub(super) struct Provisioned {
    pub wallet_id: Option<String>,
    pub address: Option<Address>,
}

pub(super) fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(super) fn transport_err(provider: &'static str, e: reqwest::Error) -> AdapterError {
    AdapterError::Provider {
        provider,
        message: e.to_string(),
    }
}

/// Turn a provider response into typed JSON, folding non-2xx statuses and
/// decode failures into a uniform provider error.
pub(super) async fn expect_json<T: DeserializeOwned>(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<T, AdapterError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::Provider {
            provider,
            message: format!("HTTP {status}: {body}"),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| transport_err(provider, e))
}
