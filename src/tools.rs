//! The operation catalog shared by every binding.
//!
//! A fixed set of named operations is the single contract consumed by both
//! the JSON-HTTP binding and the stdio tool-protocol binding. Each
//! operation takes a JSON arguments object and returns a JSON value; the
//! demo-mode gate refuses every write operation while leaving reads
//! untouched.

use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;

use crate::amount::format_units;
use crate::broker::{BrokerError, FetchOutcome, FetchRequest, PaymentBroker};
use crate::ledger::Ledger;
use crate::manager::{AgentIdentityPatch, ManagerError, WalletManager};
use crate::network::{Network, USDC_DECIMALS};
use crate::rules::{self, RuleError, RulesPatch};
use crate::store::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("This operation is disabled in demo mode")]
    WriteDisabled,
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// One catalog entry: the operation name, a short description for agent
/// runtimes, its JSON argument schema, and whether it mutates state.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub write: bool,
    pub input_schema: fn() -> Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn pay_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "url": { "type": "string", "description": "URL of the paid resource" },
            "method": { "type": "string" },
            "headers": { "type": "object" },
            "body": { "type": "string" },
            "reason": { "type": "string", "description": "Note recorded on the ledger entry" },
        },
        "required": ["url"],
    })
}

/// The fixed operation catalog, in presentation order.
pub const CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "config",
        description: "Broker configuration flags",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "listWallets",
        description: "List all wallets and the active wallet id",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "createWallet",
        description: "Create a wallet (local-key, privy, coinbase-cdp, crossmint, or browser) and make it active",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "adapter": { "type": "string" },
                    "credentials": { "type": "object" },
                    "label": { "type": "string" },
                },
                "required": ["adapter"],
            })
        },
    },
    ToolSpec {
        name: "switchWallet",
        description: "Make another wallet active",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": { "walletId": { "type": "string" } },
                "required": ["walletId"],
            })
        },
    },
    ToolSpec {
        name: "renameWallet",
        description: "Rename the active wallet",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": { "label": { "type": "string" } },
                "required": ["label"],
            })
        },
    },
    ToolSpec {
        name: "removeWallet",
        description: "Remove a wallet; its transactions are removed with it",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": { "walletId": { "type": "string" } },
                "required": ["walletId"],
            })
        },
    },
    ToolSpec {
        name: "getWallet",
        description: "Summary of the active wallet",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "getNetwork",
        description: "Currently selected network",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "setNetwork",
        description: "Select base or base-sepolia for all payments",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": { "network": { "type": "string", "enum": ["base", "base-sepolia"] } },
                "required": ["network"],
            })
        },
    },
    ToolSpec {
        name: "getBalance",
        description: "USDC balance of the active wallet",
        write: false,
        input_schema: || {
            json!({
                "type": "object",
                "properties": { "network": { "type": "string", "enum": ["base", "base-sepolia"] } },
            })
        },
    },
    ToolSpec {
        name: "getRules",
        description: "Spending rules of the active wallet",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "setRules",
        description: "Update spending rules; present fields replace stored ones",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "maxPerTransaction": { "type": ["string", "null"] },
                    "dailyCap": { "type": ["string", "null"] },
                    "allowedServices": { "type": "array", "items": { "type": "string" } },
                    "blockedServices": { "type": "array", "items": { "type": "string" } },
                },
            })
        },
    },
    ToolSpec {
        name: "listTransactions",
        description: "Newest-first transactions of the active wallet",
        write: false,
        input_schema: || {
            json!({
                "type": "object",
                "properties": { "limit": { "type": "integer", "maximum": 200 } },
            })
        },
    },
    ToolSpec {
        name: "todaySpent",
        description: "USDC settled today (UTC) by the active wallet",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "getAgentIdentity",
        description: "Agent identity of the active wallet",
        write: false,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "setAgentIdentity",
        description: "Update the agent identity announced on paid requests",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "agentId": { "type": "string" },
                    "agentRegistry": { "type": "string" },
                    "metadataUri": { "type": "string" },
                },
                "required": ["name"],
            })
        },
    },
    ToolSpec {
        name: "pay",
        description: "Fetch a URL, paying the x402 price if one is asked",
        write: true,
        input_schema: pay_schema,
    },
    ToolSpec {
        name: "payPrepare",
        description: "Negotiate a payment and return typed data for an external signer",
        write: true,
        input_schema: pay_schema,
    },
    ToolSpec {
        name: "payComplete",
        description: "Finish a prepared payment with an externally produced signature",
        write: true,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "sessionId": { "type": "string" },
                    "signature": { "type": "string" },
                },
                "required": ["sessionId", "signature"],
            })
        },
    },
    ToolSpec {
        name: "freeze",
        description: "Freeze the active wallet; payments are refused until unfrozen",
        write: true,
        input_schema: empty_schema,
    },
    ToolSpec {
        name: "unfreeze",
        description: "Unfreeze the active wallet",
        write: true,
        input_schema: empty_schema,
    },
];

pub fn catalog_entry(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// Everything a binding needs: the core components plus the demo flag.
pub struct App {
    pub store: Arc<StateStore>,
    pub manager: Arc<WalletManager>,
    pub ledger: Arc<Ledger>,
    pub broker: Arc<PaymentBroker>,
    pub demo_mode: bool,
}

impl App {
    pub fn new(store: Arc<StateStore>, demo_mode: bool) -> Arc<Self> {
        let manager = Arc::new(WalletManager::new(store.clone()));
        let ledger = Arc::new(Ledger::new(store.clone()));
        let broker = Arc::new(PaymentBroker::new(
            store.clone(),
            manager.clone(),
            ledger.clone(),
        ));
        Arc::new(App {
            store,
            manager,
            ledger,
            broker,
            demo_mode,
        })
    }

    /// Run one catalog operation. Payment operations never surface as
    /// errors; they return the normalized `{status, body, payment, error?}`
    /// envelope with `status: 0` for failures before the retry.
    pub async fn dispatch(&self, operation: &str, args: Value) -> Result<Value, ToolError> {
        let spec = catalog_entry(operation)
            .ok_or_else(|| ToolError::UnknownOperation(operation.to_string()))?;
        if self.demo_mode && spec.write {
            return Err(ToolError::WriteDisabled);
        }
        let args = if args.is_null() { json!({}) } else { args };

        match operation {
            "config" => Ok(json!({ "demoMode": self.demo_mode })),
            "listWallets" => {
                let (wallets, active_wallet_id) = self.manager.list().await;
                Ok(json!({ "wallets": wallets, "activeWalletId": active_wallet_id }))
            }
            "createWallet" => {
                #[derive(Deserialize)]
                struct Args {
                    adapter: String,
                    #[serde(default)]
                    credentials: Option<Value>,
                    #[serde(default)]
                    label: Option<String>,
                }
                let args: Args = parse_args(args)?;
                let summary = self
                    .manager
                    .create(&args.adapter, args.credentials.as_ref(), args.label)
                    .await?;
                Ok(json!(summary))
            }
            "switchWallet" => {
                let args: WalletIdArgs = parse_args(args)?;
                let summary = self.manager.switch(&args.wallet_id).await?;
                Ok(json!({ "activeWalletId": summary.id, "label": summary.label }))
            }
            "renameWallet" => {
                #[derive(Deserialize)]
                struct Args {
                    label: String,
                }
                let args: Args = parse_args(args)?;
                let label = self.manager.rename(&args.label).await?;
                Ok(json!({ "label": label }))
            }
            "removeWallet" => {
                let args: WalletIdArgs = parse_args(args)?;
                self.manager.remove(&args.wallet_id).await?;
                Ok(json!({ "deleted": true }))
            }
            "getWallet" => match self.manager.active_summary().await {
                Some(summary) => {
                    let adapter = summary.adapter;
                    Ok(json!({ "wallet": summary, "adapter": adapter }))
                }
                None => Ok(json!({ "wallet": null, "adapter": null })),
            },
            "getNetwork" => {
                let network = self.store.network().await;
                Ok(json!({ "network": network }))
            }
            "setNetwork" => {
                #[derive(Deserialize)]
                struct Args {
                    network: String,
                }
                let args: Args = parse_args(args)?;
                let network = Network::from_str(&args.network)
                    .map_err(|e| ToolError::Validation(e.to_string()))?;
                self.store.set_network(network).await?;
                Ok(json!({ "network": network }))
            }
            "getBalance" => {
                #[derive(Deserialize, Default)]
                struct Args {
                    #[serde(default)]
                    network: Option<String>,
                }
                let args: Args = parse_args(args)?;
                let network = args
                    .network
                    .as_deref()
                    .map(Network::from_str)
                    .transpose()
                    .map_err(|e| ToolError::Validation(e.to_string()))?;
                let (balance, network) = self
                    .manager
                    .balance(network)
                    .await
                    .map_err(ToolError::from)?;
                Ok(json!({ "balance": balance, "network": network }))
            }
            "getRules" => {
                let wallet = self.store.require_active().await?;
                Ok(json!(wallet.rules))
            }
            "setRules" => {
                let patch: RulesPatch = parse_args(args)?;
                let rules = self
                    .store
                    .try_update(move |doc| {
                        let wallet = doc.require_active_mut().map_err(ToolError::from)?;
                        rules::apply_patch(&mut wallet.rules, patch)?;
                        Ok::<_, ToolError>(wallet.rules.clone())
                    })
                    .await?;
                Ok(json!(rules))
            }
            "listTransactions" => {
                #[derive(Deserialize, Default)]
                struct Args {
                    #[serde(default)]
                    limit: Option<usize>,
                }
                let args: Args = parse_args(args)?;
                let transactions = self.ledger.list(args.limit).await?;
                Ok(json!({ "transactions": transactions }))
            }
            "todaySpent" => {
                let spent = self.ledger.today_spent().await?;
                Ok(json!({ "spent": format_units(spent, USDC_DECIMALS) }))
            }
            "getAgentIdentity" => {
                let identity = self.manager.agent_identity().await?;
                Ok(json!({ "agentIdentity": identity }))
            }
            "setAgentIdentity" => {
                let patch: AgentIdentityPatch = parse_args(args)?;
                let identity = self.manager.set_agent_identity(patch).await?;
                Ok(json!({ "agentIdentity": identity }))
            }
            "pay" => {
                let request: FetchRequest = parse_args(args)?;
                Ok(payment_envelope(self.broker.fetch(request).await))
            }
            "payPrepare" => {
                let request: FetchRequest = parse_args(args)?;
                match self.broker.prepare(request).await {
                    Ok(descriptor) => Ok(json!(descriptor)),
                    Err(e) => Ok(payment_error_envelope(e)),
                }
            }
            "payComplete" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Args {
                    session_id: String,
                    signature: String,
                }
                let args: Args = parse_args(args)?;
                Ok(payment_envelope(
                    self.broker.complete(&args.session_id, &args.signature).await,
                ))
            }
            "freeze" => {
                let frozen = self.manager.set_frozen(true).await?;
                Ok(json!({ "frozen": frozen }))
            }
            "unfreeze" => {
                let frozen = self.manager.set_frozen(false).await?;
                Ok(json!({ "frozen": frozen }))
            }
            other => Err(ToolError::UnknownOperation(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletIdArgs {
    wallet_id: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::Validation(format!("Invalid arguments: {e}")))
}

fn payment_envelope(result: Result<FetchOutcome, BrokerError>) -> Value {
    match result {
        Ok(outcome) => json!({
            "status": outcome.status,
            "headers": outcome.headers,
            "body": outcome.body,
            "payment": outcome.payment,
        }),
        Err(e) => payment_error_envelope(e),
    }
}

fn payment_error_envelope(error: BrokerError) -> Value {
    json!({
        "status": 0,
        "error": error.to_string(),
        "body": null,
        "payment": null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn app(demo_mode: bool) -> (tempfile::TempDir, Arc<App>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).await.unwrap());
        (dir, App::new(store, demo_mode))
    }

    #[tokio::test]
    async fn demo_mode_gates_writes_only() {
        let (_dir, app) = app(true).await;
        assert_eq!(
            app.dispatch("config", Value::Null).await.unwrap(),
            json!({ "demoMode": true })
        );
        // Reads pass.
        app.dispatch("listWallets", Value::Null).await.unwrap();
        // Writes are refused.
        let err = app
            .dispatch("createWallet", json!({ "adapter": "local-key" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::WriteDisabled));
        let pay = app
            .dispatch("pay", json!({ "url": "https://api.example.com/x" }))
            .await
            .unwrap_err();
        assert!(matches!(pay, ToolError::WriteDisabled));
    }

    #[tokio::test]
    async fn wallet_lifecycle_through_the_catalog() {
        let (_dir, app) = app(false).await;

        let created = app
            .dispatch("createWallet", json!({ "adapter": "local-key" }))
            .await
            .unwrap();
        let wallet_id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["adapter"], "local-key");

        let listed = app.dispatch("listWallets", Value::Null).await.unwrap();
        assert_eq!(listed["activeWalletId"], wallet_id.as_str());
        assert_eq!(listed["wallets"].as_array().unwrap().len(), 1);

        let renamed = app
            .dispatch("renameWallet", json!({ "label": "Ops" }))
            .await
            .unwrap();
        assert_eq!(renamed["label"], "Ops");

        let frozen = app.dispatch("freeze", Value::Null).await.unwrap();
        assert_eq!(frozen["frozen"], true);
        let unfrozen = app.dispatch("unfreeze", Value::Null).await.unwrap();
        assert_eq!(unfrozen["frozen"], false);

        let removed = app
            .dispatch("removeWallet", json!({ "walletId": wallet_id }))
            .await
            .unwrap();
        assert_eq!(removed["deleted"], true);
        let wallet = app.dispatch("getWallet", Value::Null).await.unwrap();
        assert_eq!(wallet["wallet"], Value::Null);
    }

    #[tokio::test]
    async fn network_selection_validates_input() {
        let (_dir, app) = app(false).await;
        assert_eq!(
            app.dispatch("getNetwork", Value::Null).await.unwrap(),
            json!({ "network": "base" })
        );
        let set = app
            .dispatch("setNetwork", json!({ "network": "base-sepolia" }))
            .await
            .unwrap();
        assert_eq!(set, json!({ "network": "base-sepolia" }));

        let err = app
            .dispatch("setNetwork", json!({ "network": "optimism" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
        // The bad input did not change the selection.
        assert_eq!(
            app.dispatch("getNetwork", Value::Null).await.unwrap(),
            json!({ "network": "base-sepolia" })
        );
    }

    #[tokio::test]
    async fn rules_roundtrip_through_the_catalog() {
        let (_dir, app) = app(false).await;
        app.dispatch("createWallet", json!({ "adapter": "local-key" }))
            .await
            .unwrap();

        let rules = app
            .dispatch(
                "setRules",
                json!({ "maxPerTransaction": "5.00", "blockedServices": ["Evil.Example"] }),
            )
            .await
            .unwrap();
        assert_eq!(rules["maxPerTransaction"], "5.00");
        assert_eq!(rules["blockedServices"], json!(["evil.example"]));

        let read_back = app.dispatch("getRules", Value::Null).await.unwrap();
        assert_eq!(read_back, rules);

        let spent = app.dispatch("todaySpent", Value::Null).await.unwrap();
        assert_eq!(spent, json!({ "spent": "0.0" }));
    }

    #[tokio::test]
    async fn unknown_operation_is_reported() {
        let (_dir, app) = app(false).await;
        let err = app.dispatch("mintMoney", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownOperation(_)));
    }

    #[test]
    fn catalog_covers_the_tool_table() {
        for name in [
            "config",
            "listWallets",
            "createWallet",
            "switchWallet",
            "renameWallet",
            "removeWallet",
            "getWallet",
            "getNetwork",
            "setNetwork",
            "getBalance",
            "getRules",
            "setRules",
            "listTransactions",
            "todaySpent",
            "getAgentIdentity",
            "setAgentIdentity",
            "pay",
            "payPrepare",
            "payComplete",
            "freeze",
            "unfreeze",
        ] {
            assert!(catalog_entry(name).is_some(), "missing operation {name}");
        }
    }
}
