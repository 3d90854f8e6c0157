//! Wallet adapters: a uniform signer + balance + address contract over
//! self-custodial, managed, and externally-signing wallets.
//!
//! Managed providers are optional integrations selected by cargo feature
//! (the `privy`, `coinbase-cdp` and `crossmint` features, all on by
//! default). A build without a provider's feature still deserializes its
//! configuration but fails adapter construction with a uniform
//! "SDK not installed" error, so agent consumers never see a missing
//! integration as anything else.

mod browser;
mod local_key;
#[cfg(any(feature = "privy", feature = "coinbase-cdp", feature = "crossmint"))]
mod managed;

#[cfg(feature = "coinbase-cdp")]
mod coinbase_cdp;
#[cfg(feature = "crossmint")]
mod crossmint;
#[cfg(feature = "privy")]
mod privy;

pub use browser::BrowserAdapter;
pub use local_key::LocalKeyAdapter;

use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;

use crate::erc20::ChainError;
use crate::network::Network;
use crate::proto::TransferWithAuthorization;
use crate::store::AdapterConfig;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Wallet not initialized. Provision it first")]
    NotInitialized,
    #[error("The {0} provider SDK is not installed. Rebuild with the \"{0}\" feature enabled")]
    SdkNotInstalled(&'static str),
    #[error("Browser wallets sign client-side. Use the prepare/complete payment flow")]
    MustSignClientSide,
    #[error("Invalid wallet configuration: {0}")]
    InvalidConfig(String),
    #[error("{provider} request failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// An EIP-712 signing request for an ERC-3009 authorization under the USDC
/// domain of the given network.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub network: Network,
    pub authorization: TransferWithAuthorization,
}

/// Uniform contract implemented by every custody variant.
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    /// Create or claim the underlying wallet. Idempotent: a second call on
    /// an already-provisioned adapter returns the existing address.
    async fn provision(&self) -> Result<Address, AdapterError>;

    /// The wallet address; fails if no wallet has been provisioned.
    fn address(&self) -> Result<Address, AdapterError>;

    fn is_initialized(&self) -> bool;

    /// Produce the 65-byte EIP-712 signature as 0x-prefixed hex.
    async fn sign_typed_data(&self, request: &SignRequest) -> Result<String, AdapterError>;

    /// Round-trip the adapter configuration, including any fields learned
    /// during provisioning (wallet id, address).
    fn serialize(&self) -> AdapterConfig;

    /// USDC balance of the wallet on `network` as a human-readable decimal
    /// string.
    async fn balance(&self, network: Network) -> Result<String, AdapterError> {
        let holder = self.address()?;
        Ok(crate::erc20::usdc_balance(network, holder).await?)
    }
}

/// Hydrate an adapter from a persisted configuration.
pub fn build(config: &AdapterConfig) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    match config {
        AdapterConfig::LocalKey { private_key } => {
            let adapter = if private_key.is_empty() {
                LocalKeyAdapter::new()
            } else {
                LocalKeyAdapter::from_key(private_key)?
            };
            Ok(Arc::new(adapter))
        }
        AdapterConfig::Privy {
            app_id,
            app_secret,
            wallet_id,
            address,
        } => build_privy(app_id, app_secret, wallet_id.clone(), address.as_deref()),
        AdapterConfig::CoinbaseCdp {
            api_key_id,
            api_key_secret,
            wallet_id,
            address,
        } => build_coinbase_cdp(
            api_key_id,
            api_key_secret,
            wallet_id.clone(),
            address.as_deref(),
        ),
        AdapterConfig::Crossmint {
            api_key,
            wallet_id,
            address,
        } => build_crossmint(api_key, wallet_id.clone(), address.as_deref()),
        AdapterConfig::Browser { address } => Ok(Arc::new(BrowserAdapter::from_address(address)?)),
    }
}

#[cfg(feature = "privy")]
fn build_privy(
    app_id: &str,
    app_secret: &str,
    wallet_id: Option<String>,
    address: Option<&str>,
) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    Ok(Arc::new(privy::PrivyAdapter::new(
        app_id, app_secret, wallet_id, address,
    )?))
}

#[cfg(not(feature = "privy"))]
fn build_privy(
    _app_id: &str,
    _app_secret: &str,
    _wallet_id: Option<String>,
    _address: Option<&str>,
) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    Err(AdapterError::SdkNotInstalled("privy"))
}

#[cfg(feature = "coinbase-cdp")]
fn build_coinbase_cdp(
    api_key_id: &str,
    api_key_secret: &str,
    wallet_id: Option<String>,
    address: Option<&str>,
) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    Ok(Arc::new(coinbase_cdp::CoinbaseCdpAdapter::new(
        api_key_id,
        api_key_secret,
        wallet_id,
        address,
    )?))
}

#[cfg(not(feature = "coinbase-cdp"))]
fn build_coinbase_cdp(
    _api_key_id: &str,
    _api_key_secret: &str,
    _wallet_id: Option<String>,
    _address: Option<&str>,
) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    Err(AdapterError::SdkNotInstalled("coinbase-cdp"))
}

#[cfg(feature = "crossmint")]
fn build_crossmint(
    api_key: &str,
    wallet_id: Option<String>,
    address: Option<&str>,
) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    Ok(Arc::new(crossmint::CrossmintAdapter::new(
        api_key, wallet_id, address,
    )?))
}

#[cfg(not(feature = "crossmint"))]
fn build_crossmint(
    _api_key: &str,
    _wallet_id: Option<String>,
    _address: Option<&str>,
) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    Err(AdapterError::SdkNotInstalled("crossmint"))
}

pub(crate) fn parse_address(value: &str) -> Result<Address, AdapterError> {
    value
        .parse::<Address>()
        .map_err(|e| AdapterError::InvalidConfig(format!("Bad address {value}: {e}")))
}
