//! Wallet lifecycle: create, switch, remove, freeze, rename, identity.
//!
//! Thin façade over the state store and the adapter layer. Adapters are
//! cached per wallet id so rehydration from persistence is a one-time cost;
//! cache entries are immutable after insert.

use alloy_signer_local::PrivateKeySigner;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::adapter::{self, AdapterError, WalletAdapter};
use crate::network::Network;
use crate::store::{
    AdapterConfig, AgentIdentity, SpendingRules, StateStore, StoreError, WalletEntry,
};
use crate::util;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("{0}")]
    Validation(String),
}

/// What the tool surface reports about a wallet. The address is derived
/// locally (from the key or the cached provider address) so listing never
/// touches the network.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub id: String,
    pub label: String,
    pub address: Option<String>,
    pub frozen: bool,
    pub adapter: &'static str,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_identity: Option<AgentIdentity>,
}

/// Partial agent-identity update; `name` is required when no identity exists
/// yet, present fields replace stored ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentityPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub agent_id: Option<String>,
    pub agent_registry: Option<String>,
    pub metadata_uri: Option<String>,
}

pub struct WalletManager {
    store: Arc<StateStore>,
    adapters: DashMap<String, Arc<dyn WalletAdapter>>,
}

impl WalletManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        WalletManager {
            store,
            adapters: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Construct the adapter, provision the underlying wallet, and persist a
    /// new entry with default rules. The new wallet becomes active.
    pub async fn create(
        &self,
        kind: &str,
        credentials: Option<&Value>,
        label: Option<String>,
    ) -> Result<WalletSummary, ManagerError> {
        let config = config_from_request(kind, credentials)?;
        let adapter = adapter::build(&config)?;
        adapter.provision().await?;

        let id = util::wallet_id();
        let entry_id = id.clone();
        let adapter_config = adapter.serialize();
        let summary = self
            .store
            .try_update(move |doc| {
                let entry = WalletEntry {
                    id: entry_id.clone(),
                    label: label.unwrap_or_else(|| format!("Wallet {}", doc.wallets.len() + 1)),
                    created_at: util::now_iso(),
                    frozen: false,
                    adapter: adapter_config,
                    rules: SpendingRules::default(),
                    transactions: Vec::new(),
                    agent_identity: None,
                };
                let summary = summarize(&entry);
                doc.wallets.push(entry);
                doc.active_wallet_id = Some(entry_id);
                Ok::<_, ManagerError>(summary)
            })
            .await?;
        self.adapters.insert(id, adapter);
        Ok(summary)
    }

    /// All wallet summaries plus the active id.
    pub async fn list(&self) -> (Vec<WalletSummary>, Option<String>) {
        let doc = self.store.document().await;
        let summaries = doc.wallets.iter().map(summarize).collect();
        (summaries, doc.active_wallet_id)
    }

    /// Summary of the active wallet, if any.
    pub async fn active_summary(&self) -> Option<WalletSummary> {
        self.store.active_wallet().await.map(|w| summarize(&w))
    }

    pub async fn switch(&self, id: &str) -> Result<WalletSummary, ManagerError> {
        let id = id.to_string();
        let summary = self
            .store
            .update(move |doc| {
                let wallet = doc.wallet_mut(&id)?;
                let summary = summarize(wallet);
                doc.active_wallet_id = Some(id);
                Ok(summary)
            })
            .await?;
        Ok(summary)
    }

    /// Remove a wallet. When the active wallet is removed the first
    /// remaining one (if any) becomes active.
    pub async fn remove(&self, id: &str) -> Result<(), ManagerError> {
        let target = id.to_string();
        self.store
            .update(move |doc| {
                let before = doc.wallets.len();
                doc.wallets.retain(|w| w.id != target);
                if doc.wallets.len() == before {
                    return Err(StoreError::WalletNotFound(target));
                }
                if doc.active_wallet_id.as_deref() == Some(target.as_str()) {
                    doc.active_wallet_id = doc.wallets.first().map(|w| w.id.clone());
                }
                Ok(())
            })
            .await?;
        self.adapters.remove(id);
        Ok(())
    }

    pub async fn rename(&self, label: &str) -> Result<String, ManagerError> {
        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(ManagerError::Validation("Label must not be empty".into()));
        }
        let applied = label.clone();
        self.store
            .update(move |doc| {
                doc.require_active_mut()?.label = label;
                Ok(())
            })
            .await?;
        Ok(applied)
    }

    pub async fn set_frozen(&self, frozen: bool) -> Result<bool, ManagerError> {
        self.store
            .update(move |doc| {
                doc.require_active_mut()?.frozen = frozen;
                Ok(frozen)
            })
            .await
            .map_err(ManagerError::from)
    }

    pub async fn agent_identity(&self) -> Result<Option<AgentIdentity>, ManagerError> {
        Ok(self.store.require_active().await?.agent_identity)
    }

    pub async fn set_agent_identity(
        &self,
        patch: AgentIdentityPatch,
    ) -> Result<AgentIdentity, ManagerError> {
        self.store
            .try_update(move |doc| {
                let wallet = doc.require_active_mut().map_err(ManagerError::from)?;
                let mut identity = wallet.agent_identity.clone().unwrap_or(AgentIdentity {
                    name: String::new(),
                    description: None,
                    agent_id: None,
                    agent_registry: None,
                    metadata_uri: None,
                });
                if let Some(name) = patch.name {
                    identity.name = name;
                }
                if identity.name.trim().is_empty() {
                    return Err(ManagerError::Validation(
                        "Agent identity requires a name".into(),
                    ));
                }
                if let Some(description) = patch.description {
                    identity.description = Some(description);
                }
                if let Some(agent_id) = patch.agent_id {
                    identity.agent_id = Some(agent_id);
                }
                if let Some(agent_registry) = patch.agent_registry {
                    identity.agent_registry = Some(agent_registry);
                }
                if let Some(metadata_uri) = patch.metadata_uri {
                    identity.metadata_uri = Some(metadata_uri);
                }
                wallet.agent_identity = Some(identity.clone());
                Ok(identity)
            })
            .await
    }

    /// USDC balance of the active wallet, on the given network or the
    /// process-wide selection.
    pub async fn balance(
        &self,
        network: Option<Network>,
    ) -> Result<(String, Network), ManagerError> {
        let network = match network {
            Some(n) => n,
            None => self.store.network().await,
        };
        let (_, adapter) = self.adapter_for_active().await?;
        let balance = adapter.balance(network).await?;
        Ok((balance, network))
    }

    /// The active wallet entry plus its (cached) adapter.
    pub async fn adapter_for_active(
        &self,
    ) -> Result<(WalletEntry, Arc<dyn WalletAdapter>), ManagerError> {
        let wallet = self.store.require_active().await?;
        if let Some(cached) = self.adapters.get(&wallet.id) {
            let adapter = cached.value().clone();
            return Ok((wallet, adapter));
        }
        let adapter = adapter::build(&wallet.adapter)?;
        self.adapters.insert(wallet.id.clone(), adapter.clone());
        Ok((wallet, adapter))
    }
}

fn summarize(entry: &WalletEntry) -> WalletSummary {
    WalletSummary {
        id: entry.id.clone(),
        label: entry.label.clone(),
        address: config_address(&entry.adapter),
        frozen: entry.frozen,
        adapter: entry.adapter.kind(),
        created_at: entry.created_at.clone(),
        agent_identity: entry.agent_identity.clone(),
    }
}

/// Derive the wallet address from its persisted configuration without any
/// network access.
pub fn config_address(config: &AdapterConfig) -> Option<String> {
    match config {
        AdapterConfig::LocalKey { private_key } => private_key
            .parse::<PrivateKeySigner>()
            .ok()
            .map(|s| s.address().to_string()),
        other => other.cached_address().map(str::to_string),
    }
}

fn config_from_request(kind: &str, credentials: Option<&Value>) -> Result<AdapterConfig, ManagerError> {
    fn parse<T: serde::de::DeserializeOwned>(
        kind: &str,
        credentials: Option<&Value>,
        expectation: &str,
    ) -> Result<T, ManagerError> {
        let value = credentials.cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|_| {
            ManagerError::Validation(format!("{kind} wallets require {expectation}"))
        })
    }

    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    struct LocalKeyCredentials {
        #[serde(default)]
        private_key: Option<String>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct PrivyCredentials {
        app_id: String,
        app_secret: String,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CdpCredentials {
        api_key_id: String,
        api_key_secret: String,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CrossmintCredentials {
        api_key: String,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct BrowserCredentials {
        address: String,
    }

    match kind {
        "local-key" => {
            let creds = credentials
                .map(|v| {
                    serde_json::from_value::<LocalKeyCredentials>(v.clone()).map_err(|_| {
                        ManagerError::Validation(
                            "local-key credentials accept only privateKey".into(),
                        )
                    })
                })
                .transpose()?
                .unwrap_or_default();
            Ok(AdapterConfig::LocalKey {
                private_key: creds.private_key.unwrap_or_default(),
            })
        }
        "privy" => {
            let creds: PrivyCredentials = parse(kind, credentials, "appId and appSecret")?;
            Ok(AdapterConfig::Privy {
                app_id: creds.app_id,
                app_secret: creds.app_secret,
                wallet_id: None,
                address: None,
            })
        }
        "coinbase-cdp" => {
            let creds: CdpCredentials = parse(kind, credentials, "apiKeyId and apiKeySecret")?;
            Ok(AdapterConfig::CoinbaseCdp {
                api_key_id: creds.api_key_id,
                api_key_secret: creds.api_key_secret,
                wallet_id: None,
                address: None,
            })
        }
        "crossmint" => {
            let creds: CrossmintCredentials = parse(kind, credentials, "apiKey")?;
            Ok(AdapterConfig::Crossmint {
                api_key: creds.api_key,
                wallet_id: None,
                address: None,
            })
        }
        "browser" => {
            let creds: BrowserCredentials = parse(kind, credentials, "an address")?;
            Ok(AdapterConfig::Browser {
                address: creds.address,
            })
        }
        other => Err(ManagerError::Validation(format!(
            "Unknown adapter type: {other}. Expected one of local-key, privy, coinbase-cdp, crossmint, browser"
        ))),
    }
}
