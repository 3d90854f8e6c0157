//! Read-only chain I/O: ERC-20 balance queries over JSON-RPC.

use alloy_primitives::Address;
use alloy_provider::ProviderBuilder;
use alloy_sol_types::sol;
use url::Url;

use crate::amount::format_units;
use crate::network::{Network, USDCDeployment};

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid RPC URL: {0}")]
    RpcUrl(String),
    #[error("Contract call failed: {0}")]
    ContractCall(String),
}

/// Query the USDC balance of `holder` on `network` and format it as a
/// human-readable decimal string, using the decimals reported by the
/// contract.
pub async fn usdc_balance(network: Network, holder: Address) -> Result<String, ChainError> {
    let usdc = USDCDeployment::by_network(network);
    let url: Url = network
        .rpc_url()
        .parse()
        .map_err(|e| ChainError::RpcUrl(format!("{e}")))?;
    let provider = ProviderBuilder::new().connect_http(url);
    let token = IERC20::new(usdc.address, &provider);

    let balance = token
        .balanceOf(holder)
        .call()
        .await
        .map_err(|e| ChainError::ContractCall(format!("{e}")))?;
    let decimals = token
        .decimals()
        .call()
        .await
        .map_err(|e| ChainError::ContractCall(format!("{e}")))?;

    Ok(format_units(balance, decimals))
}
