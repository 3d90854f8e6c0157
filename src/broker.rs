//! The x402 negotiation and retry engine.
//!
//! Three operations, all refusing work on a frozen wallet:
//!
//! - [`PaymentBroker::fetch`]: single-shot flow for server-signable
//!   adapters. Issues the upstream request once, and on a 402 selects a
//!   compatible offer, enforces the spending rules, signs an ERC-3009
//!   authorization, and retries with the payment headers.
//! - [`PaymentBroker::prepare`] / [`PaymentBroker::complete`]: two-phase
//!   flow for externally-signing wallets. `prepare` stops right before
//!   signing and parks the authorization in an in-memory session table;
//!   `complete` consumes the session exactly once with the caller-supplied
//!   signature.
//!
//! A pending ledger entry is persisted before any signature is produced, so
//! a crash mid-payment always leaves an auditable record. Sessions are
//! intentionally not persisted; a restart loses them and the sweeper
//! converges the ledger via expiry.

use alloy_primitives::{Address, B256, U256};
use dashmap::DashMap;
use rand::{Rng, rng};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use crate::adapter::SignRequest;
use crate::amount::format_units;
use crate::ledger::{Ledger, NewTransaction, TxPatch, today_spent_atomic};
use crate::manager::{ManagerError, WalletManager};
use crate::network::{Network, USDC_DECIMALS, USDCDeployment};
use crate::proto::{
    AuthorizationWire, ExactEvmPayload, PAYMENT_SIGNATURE_HEADER, PaymentPayload, PaymentRequired,
    PaymentRequirements, SettleReceipt, TransferWithAuthorization, X_PAYMENT_HEADER, domain_json,
    typed_data_json,
};
use crate::rules::{self, RuleError};
use crate::store::{AgentIdentity, StateStore, StoreError, TxStatus, WalletEntry};
use crate::timestamp::UnixTimestamp;
use crate::util;

/// How often the session sweeper looks for expired payment sessions.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const SESSION_EXPIRED_REASON: &str = "Payment session expired";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Wallet is frozen. Unfreeze it to make payments")]
    Frozen,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error(
        "No compatible payment option: the server offered no \"exact\" USDC option on a supported network"
    )]
    NoCompatibleOption,
    #[error("Network mismatch: the selected network is {selected} but the server accepts {offered}")]
    NetworkMismatch { selected: String, offered: String },
    #[error("Expected 402 Payment Required from upstream, got HTTP {0}")]
    Not402(u16),
    #[error("Payment session not found or expired")]
    SessionNotFound,
    #[error("Malformed payment-required response: {0}")]
    MalformedPaymentRequired(String),
    #[error("Upstream request failed: {0}")]
    Upstream(String),
    #[error("System clock error: {0}")]
    Clock(String),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Adapter(#[from] crate::adapter::AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// A request to fetch (and if needed pay for) an HTTP resource.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
    /// Free-form note recorded on the ledger entry.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Payment details attached to a successful retry outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub tx_hash: Option<String>,
    /// Human-readable USDC amount.
    pub amount: String,
    pub pay_to: String,
}

/// The upstream response handed back to the consumer, plus payment details
/// when a payment was made.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub payment: Option<PaymentReceipt>,
}

/// What a connected wallet needs to produce the signature in the two-phase
/// flow: the session handle plus `eth_signTypedData_v4` material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub domain: Value,
    pub types: Value,
    pub primary_type: &'static str,
    pub message: AuthorizationWire,
    pub human_amount: String,
    pub pay_to: String,
    /// CAIP-2 identifier of the payment network.
    pub network: String,
}

/// A prepared-but-unsigned payment waiting for an external signature.
#[derive(Debug, Clone)]
struct PaymentSession {
    wallet_id: String,
    request: FetchRequest,
    context: PaymentContext,
    authorization: TransferWithAuthorization,
    agent_identity: Option<AgentIdentity>,
    tx_record_id: String,
    expires_at: UnixTimestamp,
}

/// Everything negotiation learned about the payment to be made.
#[derive(Debug, Clone)]
struct PaymentContext {
    x402_version: u64,
    resource: Option<Value>,
    accepted: PaymentRequirements,
    network: Network,
    service: String,
    amount: U256,
}

enum Negotiated {
    /// Upstream did not ask for payment; forward its response unchanged.
    Passthrough(FetchOutcome),
    Payment(Box<PaymentContext>),
}

pub struct PaymentBroker {
    store: Arc<StateStore>,
    manager: Arc<WalletManager>,
    ledger: Arc<Ledger>,
    http: reqwest::Client,
    sessions: DashMap<String, PaymentSession>,
}

impl PaymentBroker {
    pub fn new(store: Arc<StateStore>, manager: Arc<WalletManager>, ledger: Arc<Ledger>) -> Self {
        PaymentBroker {
            store,
            manager,
            ledger,
            http: reqwest::Client::new(),
            sessions: DashMap::new(),
        }
    }

    /// Single-shot fetch: negotiate, sign with the active wallet's adapter,
    /// retry, record the outcome.
    #[instrument(skip_all, fields(url = %request.url), err)]
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, BrokerError> {
        let (wallet, adapter) = self.manager.adapter_for_active().await?;
        if wallet.frozen {
            return Err(BrokerError::Frozen);
        }

        let context = match self.negotiate(&request, &wallet).await? {
            Negotiated::Passthrough(outcome) => return Ok(outcome),
            Negotiated::Payment(context) => *context,
        };

        let from = adapter.address()?;
        let authorization = build_authorization(from, &context.accepted, context.amount)?;
        let record = self.append_pending(&request, &context).await?;

        let sign_request = SignRequest {
            network: context.network,
            authorization: authorization.clone(),
        };
        let signature = match adapter.sign_typed_data(&sign_request).await {
            Ok(signature) => signature,
            Err(e) => {
                self.mark_failed(&wallet.id, &record.id, format!("Signing failed: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        self.execute_retry(
            &request,
            &context,
            &authorization,
            &signature,
            wallet.agent_identity.as_ref(),
            &wallet.id,
            &record.id,
        )
        .await
    }

    /// First half of the two-phase flow: negotiate and park the
    /// authorization for an external signer. A non-402 upstream response is
    /// a caller error here.
    #[instrument(skip_all, fields(url = %request.url), err)]
    pub async fn prepare(&self, request: FetchRequest) -> Result<SessionDescriptor, BrokerError> {
        let (wallet, adapter) = self.manager.adapter_for_active().await?;
        if wallet.frozen {
            return Err(BrokerError::Frozen);
        }

        let context = match self.negotiate(&request, &wallet).await? {
            Negotiated::Passthrough(outcome) => return Err(BrokerError::Not402(outcome.status)),
            Negotiated::Payment(context) => *context,
        };

        let from = adapter.address()?;
        let authorization = build_authorization(from, &context.accepted, context.amount)?;
        let record = self.append_pending(&request, &context).await?;

        let session_id = util::session_id();
        let descriptor = SessionDescriptor {
            session_id: session_id.clone(),
            domain: domain_json(context.network),
            types: typed_data_json(context.network, &authorization)["types"].clone(),
            primary_type: "TransferWithAuthorization",
            message: AuthorizationWire::from(&authorization),
            human_amount: format_units(context.amount, USDC_DECIMALS),
            pay_to: context.accepted.pay_to.clone(),
            network: context.accepted.network.clone(),
        };
        let session = PaymentSession {
            wallet_id: wallet.id.clone(),
            request,
            expires_at: UnixTimestamp::from_secs(authorization.validBefore.to::<u64>()),
            authorization,
            agent_identity: wallet.agent_identity,
            tx_record_id: record.id,
            context,
        };
        self.sessions.insert(session_id, session);
        Ok(descriptor)
    }

    /// Second half of the two-phase flow. The session is removed before the
    /// retry is issued, so a double submit observes *session-not-found*
    /// rather than a second settlement.
    ///
    /// The session's wallet is re-checked here: freezing it after `prepare`
    /// pauses the payment (the session stays parked until it expires or the
    /// wallet is unfrozen), and removing it refuses the payment outright —
    /// either way nothing goes upstream.
    #[instrument(skip_all, fields(session = %session_id), err)]
    pub async fn complete(
        &self,
        session_id: &str,
        signature: &str,
    ) -> Result<FetchOutcome, BrokerError> {
        let wallet_id = self
            .sessions
            .get(session_id)
            .map(|session| session.wallet_id.clone())
            .ok_or(BrokerError::SessionNotFound)?;
        let doc = self.store.document().await;
        match doc.wallets.iter().find(|w| w.id == wallet_id) {
            None => {
                // The ledger entry went with the wallet; the session can
                // never complete.
                self.sessions.remove(session_id);
                return Err(BrokerError::Store(StoreError::WalletNotFound(wallet_id)));
            }
            Some(wallet) if wallet.frozen => return Err(BrokerError::Frozen),
            Some(_) => {}
        }

        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Err(BrokerError::SessionNotFound);
        };
        let now = UnixTimestamp::try_now().map_err(|e| BrokerError::Clock(e.to_string()))?;
        if now > session.expires_at {
            self.mark_failed(&session.wallet_id, &session.tx_record_id, SESSION_EXPIRED_REASON)
                .await;
            return Err(BrokerError::SessionNotFound);
        }

        self.execute_retry(
            &session.request,
            &session.context,
            &session.authorization,
            signature,
            session.agent_identity.as_ref(),
            &session.wallet_id,
            &session.tx_record_id,
        )
        .await
    }

    /// Drop every expired session and mark its ledger entry failed. Safe to
    /// race with [`PaymentBroker::complete`]: removal is a compare-and-delete
    /// on the expiry, so a session is consumed by exactly one of the two.
    pub async fn sweep_expired(&self) {
        let Ok(now) = UnixTimestamp::try_now() else {
            return;
        };
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now > entry.value().expires_at)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in expired {
            if let Some((_, session)) = self
                .sessions
                .remove_if(&session_id, |_, s| now > s.expires_at)
            {
                tracing::info!(session = %session_id, "Expiring payment session");
                self.mark_failed(&session.wallet_id, &session.tx_record_id, SESSION_EXPIRED_REASON)
                    .await;
            }
        }
    }

    /// Run [`PaymentBroker::sweep_expired`] every minute until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => broker.sweep_expired().await,
                }
            }
        })
    }

    /// Number of sessions currently parked. Exposed for the dashboard.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Issue the upstream request once and decide whether payment is due.
    async fn negotiate(
        &self,
        request: &FetchRequest,
        wallet: &WalletEntry,
    ) -> Result<Negotiated, BrokerError> {
        let url = Url::parse(&request.url).map_err(|e| BrokerError::InvalidUrl(e.to_string()))?;
        let service = url.host_str().unwrap_or_default().to_lowercase();

        let response = self
            .build_request(request)?
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| BrokerError::Upstream(e.to_string()))?;

        if status != reqwest::StatusCode::PAYMENT_REQUIRED {
            return Ok(Negotiated::Passthrough(FetchOutcome {
                status: status.as_u16(),
                headers: header_map(&headers),
                body,
                payment: None,
            }));
        }

        let doc = PaymentRequired::from_response(&headers, &body).ok_or_else(|| {
            BrokerError::MalformedPaymentRequired(
                "the 402 response carried no parseable payment-required document".to_string(),
            )
        })?;

        let (accepted, network) = doc
            .accepts
            .iter()
            .find_map(|offer| {
                if offer.scheme != "exact" {
                    return None;
                }
                let network = Network::from_caip2(&offer.network)?;
                let asset = offer.asset.parse::<Address>().ok()?;
                (asset == USDCDeployment::by_network(network).address)
                    .then(|| (offer.clone(), network))
            })
            .ok_or(BrokerError::NoCompatibleOption)?;

        let selected = self.store.network().await;
        if network != selected {
            return Err(BrokerError::NetworkMismatch {
                selected: selected.caip2().to_string(),
                offered: accepted.network.clone(),
            });
        }

        let amount: U256 = accepted.amount.parse().map_err(|_| {
            BrokerError::MalformedPaymentRequired(format!(
                "amount \"{}\" is not a decimal integer",
                accepted.amount
            ))
        })?;

        let spent = today_spent_atomic(&wallet.transactions);
        rules::enforce(&wallet.rules, spent, amount, &service)?;

        Ok(Negotiated::Payment(Box::new(PaymentContext {
            x402_version: doc.x402_version,
            resource: doc.resource,
            accepted,
            network,
            service,
            amount,
        })))
    }

    async fn append_pending(
        &self,
        request: &FetchRequest,
        context: &PaymentContext,
    ) -> Result<crate::store::TxRecord, BrokerError> {
        let record = self
            .ledger
            .add(NewTransaction {
                payee: context.accepted.pay_to.clone(),
                service: context.service.clone(),
                amount: format_units(context.amount, USDC_DECIMALS),
                asset: context.accepted.asset.clone(),
                network: context.accepted.network.clone(),
                tx_hash: None,
                status: TxStatus::Pending,
                reason: request
                    .reason
                    .clone()
                    .unwrap_or_else(|| "x402 payment".to_string()),
            })
            .await?;
        Ok(record)
    }

    /// Re-issue the request with the payment headers and settle or fail the
    /// ledger entry exactly once based on the outcome.
    #[allow(clippy::too_many_arguments)]
    async fn execute_retry(
        &self,
        request: &FetchRequest,
        context: &PaymentContext,
        authorization: &TransferWithAuthorization,
        signature: &str,
        identity: Option<&AgentIdentity>,
        wallet_id: &str,
        record_id: &str,
    ) -> Result<FetchOutcome, BrokerError> {
        let payload = PaymentPayload {
            x402_version: context.x402_version,
            resource: context.resource.clone(),
            accepted: context.accepted.clone(),
            payload: ExactEvmPayload {
                signature: signature.to_string(),
                authorization: AuthorizationWire::from(authorization),
            },
        };
        let header_value = payload
            .to_header_value()
            .map_err(|e| BrokerError::Upstream(format!("payload serialization failed: {e}")))?;

        let mut builder = self
            .build_request(request)?
            .header(PAYMENT_SIGNATURE_HEADER, header_value.as_str())
            .header(X_PAYMENT_HEADER, header_value.as_str());
        if let Some(identity) = identity {
            if let (Some(agent_id), Some(registry)) = (&identity.agent_id, &identity.agent_registry)
            {
                builder = builder
                    .header("x-agent-id", agent_id.as_str())
                    .header("x-agent-registry", registry.as_str());
                if !identity.name.is_empty() {
                    builder = builder.header("x-agent-name", identity.name.as_str());
                }
            }
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.mark_failed(wallet_id, record_id, format!("Payment retry failed: {e}"))
                    .await;
                return Err(BrokerError::Upstream(e.to_string()));
            }
        };

        let status = response.status();
        let tx_hash = SettleReceipt::from_response(response.headers())
            .and_then(SettleReceipt::into_hash);
        let headers = header_map(response.headers());
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            self.ledger
                .update_in_wallet(wallet_id, record_id, TxPatch::settled(tx_hash.clone()))
                .await?;
        } else {
            self.ledger
                .update_in_wallet(
                    wallet_id,
                    record_id,
                    TxPatch::failed(format!("Payment retry returned HTTP {status}")),
                )
                .await?;
        }

        Ok(FetchOutcome {
            status: status.as_u16(),
            headers,
            body,
            payment: Some(PaymentReceipt {
                tx_hash,
                amount: format_units(context.amount, USDC_DECIMALS),
                pay_to: context.accepted.pay_to.clone(),
            }),
        })
    }

    fn build_request(&self, request: &FetchRequest) -> Result<reqwest::RequestBuilder, BrokerError> {
        let url = Url::parse(&request.url).map_err(|e| BrokerError::InvalidUrl(e.to_string()))?;
        let method = match &request.method {
            None => Method::GET,
            Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
                .map_err(|_| BrokerError::InvalidMethod(m.clone()))?,
        };
        let mut builder = self.http.request(method, url);
        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    /// Best-effort failure marking; a write error here must not mask the
    /// payment error the caller is about to see.
    async fn mark_failed(&self, wallet_id: &str, record_id: &str, reason: impl Into<String>) {
        if let Err(e) = self
            .ledger
            .update_in_wallet(wallet_id, record_id, TxPatch::failed(reason))
            .await
        {
            tracing::warn!(record = %record_id, error = %e, "Failed to mark ledger entry failed");
        }
    }
}

fn build_authorization(
    from: Address,
    accepted: &PaymentRequirements,
    value: U256,
) -> Result<TransferWithAuthorization, BrokerError> {
    let to = accepted.pay_to.parse::<Address>().map_err(|e| {
        BrokerError::MalformedPaymentRequired(format!(
            "payTo \"{}\" is not an address: {e}",
            accepted.pay_to
        ))
    })?;
    let now = UnixTimestamp::try_now().map_err(|e| BrokerError::Clock(e.to_string()))?;
    let valid_before = now + accepted.max_timeout_seconds;
    let nonce: [u8; 32] = rng().random();
    Ok(TransferWithAuthorization {
        from,
        to,
        value,
        validAfter: U256::from(now.as_secs()),
        validBefore: U256::from(valid_before.as_secs()),
        nonce: B256::from(nonce),
    })
}

fn header_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
