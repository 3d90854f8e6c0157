//! Network definitions and known token deployments.
//!
//! This module defines the supported networks with their chain IDs, CAIP-2
//! identifiers and default RPC endpoints, and provides statically known USDC
//! deployments per network.

use alloy_primitives::{Address, address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;

/// Number of decimal places for USDC on every supported network.
pub const USDC_DECIMALS: u8 = 6;

/// Supported Ethereum-compatible networks.
///
/// Used to differentiate between testnet and mainnet environments. The
/// selection is process-wide: one network applies to all wallets at a time.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::BaseSepolia => write!(f, "base-sepolia"),
            Network::Base => write!(f, "base"),
        }
    }
}

/// Error returned when a network name or CAIP-2 identifier is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("Unknown network: {0}. Expected \"base\" or \"base-sepolia\"")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Network::Base),
            "base-sepolia" => Ok(Network::BaseSepolia),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

impl Network {
    /// Return the numeric chain ID associated with the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::BaseSepolia => 84532,
            Network::Base => 8453,
        }
    }

    /// Return the CAIP-2 chain identifier, e.g. `eip155:8453`.
    pub fn caip2(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "eip155:84532",
            Network::Base => "eip155:8453",
        }
    }

    /// Resolve a CAIP-2 chain identifier back to a [`Network`].
    pub fn from_caip2(caip2: &str) -> Option<Network> {
        match caip2 {
            "eip155:84532" => Some(Network::BaseSepolia),
            "eip155:8453" => Some(Network::Base),
            _ => None,
        }
    }

    /// Return the default public RPC endpoint for the network.
    pub fn rpc_url(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "https://sepolia.base.org",
            Network::Base => "https://mainnet.base.org",
        }
    }

    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::BaseSepolia, Network::Base]
    }
}

/// EIP-712 domain parameters carried by a token deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenAssetEip712 {
    pub name: &'static str,
    pub version: &'static str,
}

/// A token contract deployed on a specific network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenAsset {
    /// The token contract address.
    pub address: Address,
    /// The network this deployment lives on.
    pub network: Network,
    /// Number of decimal places for the token.
    pub decimals: u8,
    /// EIP-712 domain parameters used for ERC-3009 signatures.
    pub eip712: TokenAssetEip712,
}

/// Lazily initialized known USDC deployment on Base Sepolia.
static USDC_BASE_SEPOLIA: Lazy<USDCDeployment> = Lazy::new(|| {
    USDCDeployment(TokenAsset {
        address: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
        network: Network::BaseSepolia,
        decimals: USDC_DECIMALS,
        eip712: TokenAssetEip712 {
            name: "USDC",
            version: "2",
        },
    })
});

/// Lazily initialized known USDC deployment on Base mainnet.
static USDC_BASE: Lazy<USDCDeployment> = Lazy::new(|| {
    USDCDeployment(TokenAsset {
        address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
        network: Network::Base,
        decimals: USDC_DECIMALS,
        eip712: TokenAssetEip712 {
            name: "USD Coin",
            version: "2",
        },
    })
});

/// A known USDC deployment as a wrapper around [`TokenAsset`].
#[derive(Clone, Debug)]
pub struct USDCDeployment(pub TokenAsset);

impl Deref for USDCDeployment {
    type Target = TokenAsset;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl USDCDeployment {
    /// Return the known USDC deployment for the given network.
    pub fn by_network<N: Borrow<Network>>(network: N) -> &'static USDCDeployment {
        match network.borrow() {
            Network::BaseSepolia => &USDC_BASE_SEPOLIA,
            Network::Base => &USDC_BASE,
        }
    }
}
