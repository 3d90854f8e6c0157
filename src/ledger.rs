//! Per-wallet transaction ledger.
//!
//! Entries are appended to the active wallet before any signature is
//! produced, so a crash mid-payment always leaves an auditable pending
//! record. Entries are never deleted; they transition pending → settled or
//! pending → failed exactly once per retry outcome.

use alloy_primitives::U256;
use std::sync::Arc;

use crate::amount::parse_units;
use crate::network::USDC_DECIMALS;
use crate::store::{StateStore, StoreError, TxRecord, TxStatus};
use crate::util;

/// Hard cap on `list` results.
pub const MAX_LIST_LIMIT: usize = 200;

/// Fields of a new ledger entry; id and timestamp are allocated on append.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payee: String,
    pub service: String,
    pub amount: String,
    pub asset: String,
    pub network: String,
    pub tx_hash: Option<String>,
    pub status: TxStatus,
    pub reason: String,
}

/// Partial update applied to an existing entry.
#[derive(Debug, Clone, Default)]
pub struct TxPatch {
    pub status: Option<TxStatus>,
    pub tx_hash: Option<String>,
    pub reason: Option<String>,
}

impl TxPatch {
    pub fn settled(tx_hash: Option<String>) -> Self {
        TxPatch {
            status: Some(TxStatus::Settled),
            tx_hash,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TxPatch {
            status: Some(TxStatus::Failed),
            tx_hash: None,
            reason: Some(reason.into()),
        }
    }
}

pub struct Ledger {
    store: Arc<StateStore>,
}

impl Ledger {
    pub fn new(store: Arc<StateStore>) -> Self {
        Ledger { store }
    }

    /// Allocate a fresh id and timestamp, append to the active wallet, and
    /// persist.
    pub async fn add(&self, new: NewTransaction) -> Result<TxRecord, StoreError> {
        let record = TxRecord {
            id: util::transaction_id(),
            timestamp: util::now_iso(),
            payee: new.payee,
            service: new.service,
            amount: new.amount,
            asset: new.asset,
            network: new.network,
            tx_hash: new.tx_hash,
            status: new.status,
            reason: new.reason,
        };
        let appended = record.clone();
        self.store
            .update(move |doc| {
                doc.require_active_mut()?.transactions.push(record);
                Ok(())
            })
            .await?;
        Ok(appended)
    }

    /// Apply a patch to an entry on the active wallet.
    pub async fn update(&self, id: &str, patch: TxPatch) -> Result<TxRecord, StoreError> {
        let id = id.to_string();
        self.store
            .update(move |doc| {
                let wallet = doc.require_active_mut()?;
                let record = wallet
                    .transactions
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or(StoreError::TransactionNotFound(id))?;
                apply_patch(record, patch);
                Ok(record.clone())
            })
            .await
    }

    /// Apply a patch to an entry on a specific wallet, regardless of which
    /// wallet is currently active. Used by the session sweeper, which may
    /// outlive a wallet switch.
    pub async fn update_in_wallet(
        &self,
        wallet_id: &str,
        id: &str,
        patch: TxPatch,
    ) -> Result<TxRecord, StoreError> {
        let wallet_id = wallet_id.to_string();
        let id = id.to_string();
        self.store
            .update(move |doc| {
                let wallet = doc.wallet_mut(&wallet_id)?;
                let record = wallet
                    .transactions
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or(StoreError::TransactionNotFound(id))?;
                apply_patch(record, patch);
                Ok(record.clone())
            })
            .await
    }

    /// Newest-first slice of the active wallet's transactions.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<TxRecord>, StoreError> {
        let wallet = self.store.require_active().await?;
        let limit = limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);
        Ok(wallet.transactions.iter().rev().take(limit).cloned().collect())
    }

    /// Atomic USDC spent by the active wallet today (UTC).
    pub async fn today_spent(&self) -> Result<U256, StoreError> {
        let wallet = self.store.require_active().await?;
        Ok(today_spent_atomic(&wallet.transactions))
    }
}

fn apply_patch(record: &mut TxRecord, patch: TxPatch) {
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(tx_hash) = patch.tx_hash {
        record.tx_hash = Some(tx_hash);
    }
    if let Some(reason) = patch.reason {
        record.reason = reason;
    }
}

/// Sum of settled amounts whose timestamp falls on the current UTC date, in
/// atomic units. Recomputed from the ledger on each call.
pub fn today_spent_atomic(transactions: &[TxRecord]) -> U256 {
    let today = util::today_utc();
    transactions
        .iter()
        .filter(|t| t.status == TxStatus::Settled && t.timestamp.starts_with(&today))
        .filter_map(|t| parse_units(&t.amount, USDC_DECIMALS).ok())
        .fold(U256::ZERO, |acc, amount| acc.saturating_add(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AdapterConfig, SpendingRules, StateStore, WalletEntry};

    async fn store_with_wallet() -> (tempfile::TempDir, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).await.unwrap());
        store
            .update(|doc| {
                doc.wallets.push(WalletEntry {
                    id: "deadbeefdeadbeef".into(),
                    label: "Wallet 1".into(),
                    created_at: util::now_iso(),
                    frozen: false,
                    adapter: AdapterConfig::Browser {
                        address: "0x1111111111111111111111111111111111111111".into(),
                    },
                    rules: SpendingRules::default(),
                    transactions: vec![],
                    agent_identity: None,
                });
                doc.active_wallet_id = Some("deadbeefdeadbeef".into());
                Ok(())
            })
            .await
            .unwrap();
        (dir, store)
    }

    fn sample_tx(amount: &str) -> NewTransaction {
        NewTransaction {
            payee: "0x2222222222222222222222222222222222222222".into(),
            service: "api.example.com".into(),
            amount: amount.into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            network: "eip155:84532".into(),
            tx_hash: None,
            status: TxStatus::Pending,
            reason: "x402 payment".into(),
        }
    }

    #[tokio::test]
    async fn append_preserves_order_and_list_reverses_it() {
        let (_dir, store) = store_with_wallet().await;
        let ledger = Ledger::new(store.clone());

        let first = ledger.add(sample_tx("0.1")).await.unwrap();
        let second = ledger.add(sample_tx("0.2")).await.unwrap();
        assert_ne!(first.id, second.id);

        let wallet = store.require_active().await.unwrap();
        assert_eq!(wallet.transactions.len(), 2);
        assert_eq!(wallet.transactions[0].id, first.id);

        let listed = ledger.list(None).await.unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        let capped = ledger.list(Some(1)).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, second.id);
    }

    #[tokio::test]
    async fn update_transitions_status() {
        let (_dir, store) = store_with_wallet().await;
        let ledger = Ledger::new(store);

        let record = ledger.add(sample_tx("0.1")).await.unwrap();
        let settled = ledger
            .update(&record.id, TxPatch::settled(Some("0xabc".into())))
            .await
            .unwrap();
        assert_eq!(settled.status, TxStatus::Settled);
        assert_eq!(settled.tx_hash.as_deref(), Some("0xabc"));

        let err = ledger
            .update("ffffffffffffffffffffffffffffffff", TxPatch::failed("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn today_spent_counts_only_settled_today() {
        let (_dir, store) = store_with_wallet().await;
        let ledger = Ledger::new(store.clone());

        let a = ledger.add(sample_tx("0.09")).await.unwrap();
        ledger
            .update(&a.id, TxPatch::settled(Some("0x1".into())))
            .await
            .unwrap();
        // Pending entries never count.
        ledger.add(sample_tx("5.0")).await.unwrap();
        // Entries from another day never count.
        store
            .update(|doc| {
                let wallet = doc.require_active_mut()?;
                let mut old = wallet.transactions[0].clone();
                old.id = "00000000000000000000000000000099".into();
                old.timestamp = "2020-01-01T00:00:00.000Z".into();
                wallet.transactions.push(old);
                Ok(())
            })
            .await
            .unwrap();

        let spent = ledger.today_spent().await.unwrap();
        assert_eq!(spent, U256::from(90_000u64));
    }
}
