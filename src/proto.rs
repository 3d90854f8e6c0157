//! x402 wire protocol types.
//!
//! Covers both sides of the 402 handshake as seen by a paying client:
//! the `PaymentRequired` document a server responds with, the signed
//! `PaymentPayload` the client retries with, and the settlement receipt the
//! server attaches to the retry response.
//!
//! Servers in the wild disagree on header spellings; the broker sends the
//! payment payload under both `PAYMENT-SIGNATURE` and `X-PAYMENT`, and reads
//! the receipt from `payment-response` or `x-payment-response`.

use alloy_primitives::hex;
use alloy_sol_types::{Eip712Domain, eip712_domain, sol};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::network::{Network, USDCDeployment};
use crate::util::Base64Bytes;

/// Header carrying the base64-encoded [`PaymentRequired`] document on a 402.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
/// Headers carrying the base64-encoded [`PaymentPayload`] on the retry.
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
pub const X_PAYMENT_HEADER: &str = "x-payment";
/// Headers carrying the base64-encoded settlement receipt on the retry
/// response.
pub const PAYMENT_RESPONSE_HEADER: &str = "payment-response";
pub const X_PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

sol! {
    /// Solidity-compatible struct definition for ERC-3009
    /// `transferWithAuthorization`.
    ///
    /// This matches the EIP-3009 format used in EIP-712 typed data:
    /// it defines the authorization to transfer tokens from `from` to `to`
    /// for a specific `value`, valid only between `validAfter` and
    /// `validBefore` and identified by a unique `nonce`.
    #[derive(Debug, Serialize, Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// One payment option offered by a 402 response.
///
/// Lenient on purpose: unknown fields are ignored and `maxTimeoutSeconds`
/// defaults when a server omits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    /// CAIP-2 chain identifier, e.g. `eip155:8453`.
    pub network: String,
    /// Token contract address.
    pub asset: String,
    /// Amount in atomic token units, as a decimal string.
    pub amount: String,
    /// Recipient address for the payment.
    pub pay_to: String,
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

fn default_max_timeout_seconds() -> u64 {
    600
}

/// The machine-readable offer a server responds with on `402 Payment
/// Required`, carried either in the `payment-required` header (base64 JSON)
/// or as the response body (plain JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    #[serde(default = "default_x402_version")]
    pub x402_version: u64,
    #[serde(default)]
    pub accepts: Vec<PaymentRequirements>,
    /// V1 servers send a resource URL string, V2 servers an object; carried
    /// opaquely and echoed back in the payment payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_x402_version() -> u64 {
    1
}

impl PaymentRequired {
    /// Parse the payment-required document from a 402 response: the
    /// `payment-required` header takes precedence, the body is the fallback.
    pub fn from_response(headers: &reqwest::header::HeaderMap, body: &str) -> Option<Self> {
        let from_header = headers
            .get(PAYMENT_REQUIRED_HEADER)
            .and_then(|h| Base64Bytes::from(h.as_bytes()).decode_json::<PaymentRequired>());
        if from_header.is_some() {
            return from_header;
        }
        serde_json::from_str::<PaymentRequired>(body).ok()
    }
}

/// ERC-3009 authorization in wire form: every integer field is a decimal
/// string and the nonce is 0x-prefixed hex of 32 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationWire {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

impl From<&TransferWithAuthorization> for AuthorizationWire {
    fn from(auth: &TransferWithAuthorization) -> Self {
        AuthorizationWire {
            from: auth.from.to_string(),
            to: auth.to.to_string(),
            value: auth.value.to_string(),
            valid_after: auth.validAfter.to_string(),
            valid_before: auth.validBefore.to_string(),
            nonce: hex::encode_prefixed(auth.nonce),
        }
    }
}

/// Scheme payload on the retry: the EIP-712 signature plus the authorization
/// it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    /// 65-byte signature as 0x-prefixed hex.
    pub signature: String,
    pub authorization: AuthorizationWire,
}

/// Full payload the broker retries with, base64-encoded into the payment
/// headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    pub accepted: PaymentRequirements,
    pub payload: ExactEvmPayload,
}

impl PaymentPayload {
    /// Base64-encode the payload for the payment headers.
    pub fn to_header_value(&self) -> Result<String, serde_json::Error> {
        let raw = serde_json::to_vec(self)?;
        Ok(Base64Bytes::encode(&raw).to_string())
    }
}

/// Settlement receipt attached by the server to the retry response.
///
/// Servers disagree on the field name for the on-chain hash.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleReceipt {
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

impl SettleReceipt {
    /// Extract the receipt from the retry response headers, accepting either
    /// header spelling. A missing or unparseable receipt is `None`; the
    /// caller degrades `txHash` to null instead of failing.
    pub fn from_response(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let header = headers
            .get(PAYMENT_RESPONSE_HEADER)
            .or_else(|| headers.get(X_PAYMENT_RESPONSE_HEADER))?;
        Base64Bytes::from(header.as_bytes()).decode_json()
    }

    /// The on-chain transaction hash, whichever field the server used.
    pub fn into_hash(self) -> Option<String> {
        self.transaction.or(self.tx_hash)
    }
}

/// Build the EIP-712 domain for the USDC deployment on `network`.
pub fn usdc_domain(network: Network) -> Eip712Domain {
    let usdc = USDCDeployment::by_network(network);
    eip712_domain! {
        name: usdc.eip712.name,
        version: usdc.eip712.version,
        chain_id: network.chain_id(),
        verifying_contract: usdc.address,
    }
}

/// The EIP-712 type array for `TransferWithAuthorization`, as JSON.
pub fn transfer_with_authorization_types() -> Value {
    json!({
        "TransferWithAuthorization": [
            { "name": "from", "type": "address" },
            { "name": "to", "type": "address" },
            { "name": "value", "type": "uint256" },
            { "name": "validAfter", "type": "uint256" },
            { "name": "validBefore", "type": "uint256" },
            { "name": "nonce", "type": "bytes32" },
        ]
    })
}

/// The USDC EIP-712 domain on `network`, as JSON.
pub fn domain_json(network: Network) -> Value {
    let usdc = USDCDeployment::by_network(network);
    json!({
        "name": usdc.eip712.name,
        "version": usdc.eip712.version,
        "chainId": network.chain_id(),
        "verifyingContract": usdc.address.to_string(),
    })
}

/// Full `eth_signTypedData_v4`-shaped typed data for an authorization.
///
/// This is both what externally-signing wallets receive in the two-phase
/// flow and what managed providers are asked to sign.
pub fn typed_data_json(network: Network, authorization: &TransferWithAuthorization) -> Value {
    let message = AuthorizationWire::from(authorization);
    json!({
        "types": {
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
                { "name": "verifyingContract", "type": "address" },
            ],
            "TransferWithAuthorization":
                transfer_with_authorization_types()["TransferWithAuthorization"],
        },
        "primaryType": "TransferWithAuthorization",
        "domain": domain_json(network),
        "message": message,
    })
}
