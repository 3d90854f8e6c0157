//! Persistent multi-wallet state: document model, schema migration, and
//! atomic durability.
//!
//! The whole document lives in memory behind a single `tokio::sync::Mutex`
//! and is rewritten to `<dir>/state.json` on every mutation, via a
//! write-to-temp-then-rename so a crash can never leave a torn file. The
//! lock is held across the in-memory mutation and the write, which is what
//! keeps concurrent consumers (HTTP binding, stdio binding, session sweeper)
//! from interleaving.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::network::Network;
use crate::util;

/// Data directory under the working directory.
pub const DATA_DIR: &str = ".clawlet";
/// State file name inside [`DATA_DIR`].
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("State file has an unrecognized shape")]
    UnrecognizedSchema,
    #[error("No active wallet. Create one first")]
    NoActiveWallet,
    #[error("Unknown wallet: {0}")]
    WalletNotFound(String),
    #[error("Unknown transaction: {0}")]
    TransactionNotFound(String),
}

/// Per-wallet spending rules. Empty `allowed_services` means allow-all;
/// blocked patterns take precedence over allowed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingRules {
    /// Per-transaction limit as a decimal USDC string, or null for none.
    pub max_per_transaction: Option<String>,
    /// Rolling daily cap as a decimal USDC string, or null for none.
    pub daily_cap: Option<String>,
    /// Lowercase domain substrings; empty allows every service.
    #[serde(default)]
    pub allowed_services: Vec<String>,
    /// Lowercase domain substrings; matches are refused outright.
    #[serde(default)]
    pub blocked_services: Vec<String>,
}

impl Default for SpendingRules {
    fn default() -> Self {
        SpendingRules {
            max_per_transaction: None,
            daily_cap: None,
            allowed_services: Vec::new(),
            blocked_services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Settled,
    Failed,
}

/// One ledger entry. Transactions are append-only; settled entries always
/// carry a transaction hash, failed ones a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub id: String,
    /// ISO-8601 UTC timestamp of ledger append.
    pub timestamp: String,
    /// Recipient address.
    pub payee: String,
    /// Host portion of the paid URL at negotiation time.
    pub service: String,
    /// Human-readable decimal USDC amount.
    pub amount: String,
    /// Token contract address.
    pub asset: String,
    /// CAIP-2 network identifier.
    pub network: String,
    pub tx_hash: Option<String>,
    pub status: TxStatus,
    pub reason: String,
}

/// On-chain agent identity announced on paid requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// CAIP-10 locator of the identity registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_uri: Option<String>,
}

/// Adapter configuration, tagged by provider kind. This is the only part of
/// a wallet entry that differs per custody model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AdapterConfig {
    /// Self-custodial key held in the state file.
    LocalKey { private_key: String },
    Privy {
        app_id: String,
        app_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    CoinbaseCdp {
        api_key_id: String,
        api_key_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Crossmint {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Signing lives outside this process; only the address is known.
    Browser { address: String },
}

impl AdapterConfig {
    /// The wire name of the variant, e.g. `"local-key"`.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterConfig::LocalKey { .. } => "local-key",
            AdapterConfig::Privy { .. } => "privy",
            AdapterConfig::CoinbaseCdp { .. } => "coinbase-cdp",
            AdapterConfig::Crossmint { .. } => "crossmint",
            AdapterConfig::Browser { .. } => "browser",
        }
    }

    /// The address persisted with the config, if any.
    pub fn cached_address(&self) -> Option<&str> {
        match self {
            AdapterConfig::LocalKey { .. } => None,
            AdapterConfig::Privy { address, .. } => address.as_deref(),
            AdapterConfig::CoinbaseCdp { address, .. } => address.as_deref(),
            AdapterConfig::Crossmint { address, .. } => address.as_deref(),
            AdapterConfig::Browser { address } => Some(address),
        }
    }
}

/// A wallet with its custody configuration, rules, and transaction history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletEntry {
    pub id: String,
    pub label: String,
    pub created_at: String,
    pub frozen: bool,
    pub adapter: AdapterConfig,
    pub rules: SpendingRules,
    #[serde(default)]
    pub transactions: Vec<TxRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_identity: Option<AgentIdentity>,
}

/// The persisted document (schema V2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub wallets: Vec<WalletEntry>,
    pub active_wallet_id: Option<String>,
    pub network: Network,
}

impl Default for StateDocument {
    fn default() -> Self {
        StateDocument {
            wallets: Vec::new(),
            active_wallet_id: None,
            network: Network::Base,
        }
    }
}

impl StateDocument {
    pub fn active(&self) -> Option<&WalletEntry> {
        let id = self.active_wallet_id.as_deref()?;
        self.wallets.iter().find(|w| w.id == id)
    }

    pub fn active_mut(&mut self) -> Option<&mut WalletEntry> {
        let id = self.active_wallet_id.clone()?;
        self.wallets.iter_mut().find(|w| w.id == id)
    }

    pub fn require_active_mut(&mut self) -> Result<&mut WalletEntry, StoreError> {
        self.active_mut().ok_or(StoreError::NoActiveWallet)
    }

    pub fn wallet_mut(&mut self, id: &str) -> Result<&mut WalletEntry, StoreError> {
        self.wallets
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| StoreError::WalletNotFound(id.to_string()))
    }
}

/// The legacy single-wallet document (schema V1), recognized by the absence
/// of a `wallets` array and the presence of top-level `adapterConfig`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocument {
    adapter_config: AdapterConfig,
    #[serde(default)]
    #[allow(dead_code)]
    wallet: Option<serde_json::Value>,
    #[serde(default)]
    rules: Option<SpendingRules>,
    #[serde(default)]
    transactions: Vec<TxRecord>,
}

impl LegacyDocument {
    fn migrate(self) -> StateDocument {
        let id = util::wallet_id();
        let wallet = WalletEntry {
            id: id.clone(),
            label: "Wallet 1".to_string(),
            created_at: util::now_iso(),
            frozen: false,
            adapter: self.adapter_config,
            rules: self.rules.unwrap_or_default(),
            transactions: self.transactions,
            agent_identity: None,
        };
        StateDocument {
            wallets: vec![wallet],
            active_wallet_id: Some(id),
            network: Network::Base,
        }
    }
}

/// Owner of the persisted document. All reads hand out clones; all writes go
/// through [`StateStore::update`] so that persistence cannot be skipped.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    tmp_path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    /// Load or initialize the state file under `dir`, migrating a legacy
    /// document when one is found. Migration and first-run initialization
    /// persist immediately.
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(STATE_FILE);
        let tmp_path = dir.join(format!("{STATE_FILE}.tmp"));

        let (doc, dirty) = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let value: serde_json::Value = serde_json::from_slice(&raw)?;
                if value.get("wallets").is_some() {
                    (serde_json::from_value::<StateDocument>(value)?, false)
                } else if value.get("adapterConfig").is_some() {
                    let legacy: LegacyDocument = serde_json::from_value(value)?;
                    tracing::info!("Migrating single-wallet state to multi-wallet schema");
                    (legacy.migrate(), true)
                } else {
                    return Err(StoreError::UnrecognizedSchema);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (StateDocument::default(), true)
            }
            Err(err) => return Err(err.into()),
        };

        let store = StateStore {
            path,
            tmp_path,
            doc: Mutex::new(doc),
        };
        if dirty {
            let guard = store.doc.lock().await;
            store.write(&guard).await?;
        }
        Ok(store)
    }

    /// Open the store in the conventional location under `cwd`.
    pub async fn open_default() -> Result<Self, StoreError> {
        let dir = std::env::current_dir()?.join(DATA_DIR);
        Self::open(&dir).await
    }

    /// A point-in-time clone of the document.
    pub async fn document(&self) -> StateDocument {
        self.doc.lock().await.clone()
    }

    /// Mutate the document and persist, all under the store lock. If the
    /// closure fails nothing is written.
    pub async fn update<T>(
        &self,
        f: impl FnOnce(&mut StateDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.try_update(f).await
    }

    /// Like [`StateStore::update`] but for callers whose closures fail with
    /// a richer error type.
    pub async fn try_update<T, E>(
        &self,
        f: impl FnOnce(&mut StateDocument) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut doc = self.doc.lock().await;
        let out = f(&mut doc)?;
        self.write(&doc).await.map_err(E::from)?;
        Ok(out)
    }

    /// Rewrite the current document, e.g. after an external field edit.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let doc = self.doc.lock().await;
        self.write(&doc).await
    }

    pub async fn active_wallet(&self) -> Option<WalletEntry> {
        self.doc.lock().await.active().cloned()
    }

    pub async fn require_active(&self) -> Result<WalletEntry, StoreError> {
        self.active_wallet().await.ok_or(StoreError::NoActiveWallet)
    }

    pub async fn network(&self) -> Network {
        self.doc.lock().await.network
    }

    pub async fn set_network(&self, network: Network) -> Result<(), StoreError> {
        self.update(|doc| {
            doc.network = network;
            Ok(())
        })
        .await
    }

    async fn write(&self, doc: &StateDocument) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut raw = serde_json::to_vec_pretty(doc)?;
        raw.push(b'\n');
        tokio::fs::write(&self.tmp_path, &raw).await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }
}
