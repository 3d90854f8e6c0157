//! JSON-over-HTTP binding of the operation catalog.
//!
//! Every route delegates to [`App::dispatch`], so the HTTP surface and the
//! stdio tool surface cannot drift apart. Errors map to: 400 for validation
//! and rule violations, 403 for demo-mode writes, 404 for unknown ids, 502
//! for provider failures, 500 for the rest. Payment routes return the
//! normalized payment envelope with HTTP 200 even when the payment itself
//! failed before the retry.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::instrument;

use crate::adapter::AdapterError;
use crate::manager::ManagerError;
use crate::store::StoreError;
use crate::tools::{App, ToolError};

pub fn routes() -> Router<Arc<App>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/api/config", get(get_config))
        .route("/api/wallets", get(list_wallets).post(create_wallet))
        // Legacy single-wallet surface, kept as a thin alias.
        .route("/api/wallet", get(get_wallet).post(create_wallet))
        .route("/api/wallets/switch", post(switch_wallet))
        .route("/api/wallets/remove", post(remove_wallet))
        .route("/api/network", get(get_network).post(set_network))
        .route("/api/balance", get(get_balance))
        .route("/api/rules", get(get_rules).post(set_rules))
        .route("/api/transactions", get(list_transactions))
        .route("/api/spent-today", get(today_spent))
        .route("/api/identity", get(get_identity).post(set_identity))
        .route("/api/pay", post(pay))
        .route("/api/pay/prepare", post(pay_prepare))
        .route("/api/pay/complete", post(pay_complete))
        .route("/api/freeze", post(freeze))
        .route("/api/unfreeze", post(unfreeze))
}

async fn run(app: &App, operation: &str, args: Value) -> Response {
    match app.dispatch(operation, args).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(error) => error.into_response(),
    }
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        let status = match &self {
            ToolError::WriteDisabled => StatusCode::FORBIDDEN,
            ToolError::UnknownOperation(_) => StatusCode::NOT_FOUND,
            ToolError::Validation(_) | ToolError::Rule(_) => StatusCode::BAD_REQUEST,
            ToolError::Store(e) => store_status(e),
            ToolError::Manager(ManagerError::Validation(_)) => StatusCode::BAD_REQUEST,
            ToolError::Manager(ManagerError::Store(e)) => store_status(e),
            ToolError::Manager(ManagerError::Adapter(e)) => adapter_status(e),
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::NoActiveWallet => StatusCode::BAD_REQUEST,
        StoreError::WalletNotFound(_) | StoreError::TransactionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn adapter_status(error: &AdapterError) -> StatusCode {
    match error {
        AdapterError::Provider { .. } | AdapterError::Chain(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    }
}

#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    }))
}

async fn get_config(State(app): State<Arc<App>>) -> Response {
    run(&app, "config", Value::Null).await
}

async fn list_wallets(State(app): State<Arc<App>>) -> Response {
    run(&app, "listWallets", Value::Null).await
}

#[instrument(skip_all)]
async fn create_wallet(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "createWallet", body).await
}

async fn get_wallet(State(app): State<Arc<App>>) -> Response {
    run(&app, "getWallet", Value::Null).await
}

async fn switch_wallet(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "switchWallet", body).await
}

async fn remove_wallet(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "removeWallet", body).await
}

async fn get_network(State(app): State<Arc<App>>) -> Response {
    run(&app, "getNetwork", Value::Null).await
}

async fn set_network(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "setNetwork", body).await
}

#[derive(Deserialize)]
struct BalanceQuery {
    network: Option<String>,
}

async fn get_balance(
    State(app): State<Arc<App>>,
    Query(query): Query<BalanceQuery>,
) -> Response {
    run(&app, "getBalance", json!({ "network": query.network })).await
}

async fn get_rules(State(app): State<Arc<App>>) -> Response {
    run(&app, "getRules", Value::Null).await
}

async fn set_rules(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "setRules", body).await
}

#[derive(Deserialize)]
struct TransactionsQuery {
    limit: Option<usize>,
}

async fn list_transactions(
    State(app): State<Arc<App>>,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    run(&app, "listTransactions", json!({ "limit": query.limit })).await
}

async fn today_spent(State(app): State<Arc<App>>) -> Response {
    run(&app, "todaySpent", Value::Null).await
}

async fn get_identity(State(app): State<Arc<App>>) -> Response {
    run(&app, "getAgentIdentity", Value::Null).await
}

async fn set_identity(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "setAgentIdentity", body).await
}

#[instrument(skip_all)]
async fn pay(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "pay", body).await
}

#[instrument(skip_all)]
async fn pay_prepare(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "payPrepare", body).await
}

#[instrument(skip_all)]
async fn pay_complete(State(app): State<Arc<App>>, Json(body): Json<Value>) -> Response {
    run(&app, "payComplete", body).await
}

async fn freeze(State(app): State<Arc<App>>) -> Response {
    run(&app, "freeze", Value::Null).await
}

async fn unfreeze(State(app): State<Arc<App>>) -> Response {
    run(&app, "unfreeze", Value::Null).await
}
