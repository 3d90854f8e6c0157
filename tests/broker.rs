//! End-to-end payment flows against an in-process mock x402 upstream.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use clawlet::broker::{BrokerError, FetchRequest};
use clawlet::ledger::{NewTransaction, TxPatch};
use clawlet::rules::RuleError;
use clawlet::store::{StateStore, StoreError, TxStatus};
use clawlet::tools::App;
use clawlet::util::Base64Bytes;

const PAY_TO: &str = "0x2222222222222222222222222222222222222222";
const SEPOLIA_USDC: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";
const SIGNATURE: &str = "0x1111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111111";

#[derive(Clone)]
struct Upstream {
    doc: Value,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<HeaderMap>>>,
}

async fn paid_route(State(upstream): State<Upstream>, headers: HeaderMap) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    upstream.seen.lock().unwrap().push(headers.clone());
    if headers.contains_key("x-payment") && headers.contains_key("payment-signature") {
        let receipt = Base64Bytes::encode(br#"{"transaction":"0xab12"}"#.as_slice()).to_string();
        let mut response_headers = HeaderMap::new();
        response_headers.insert("payment-response", receipt.parse().unwrap());
        (StatusCode::OK, response_headers, "premium weather data").into_response()
    } else {
        (StatusCode::PAYMENT_REQUIRED, Json(upstream.doc.clone())).into_response()
    }
}

async fn free_route(State(upstream): State<Upstream>) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, "free content").into_response()
}

async fn spawn_upstream(doc: Value) -> (String, Upstream) {
    let upstream = Upstream {
        doc,
        hits: Arc::new(AtomicUsize::new(0)),
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let router = Router::new()
        .route("/paid", any(paid_route))
        .route("/free", any(free_route))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), upstream)
}

fn sepolia_doc(amount: &str, max_timeout_seconds: u64) -> Value {
    json!({
        "x402Version": 1,
        "accepts": [{
            "scheme": "exact",
            "network": "eip155:84532",
            "asset": SEPOLIA_USDC,
            "amount": amount,
            "payTo": PAY_TO,
            "maxTimeoutSeconds": max_timeout_seconds,
        }]
    })
}

async fn broker_env() -> (tempfile::TempDir, Arc<App>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).await.unwrap());
    let app = App::new(store, false);
    app.dispatch("setNetwork", json!({ "network": "base-sepolia" }))
        .await
        .unwrap();
    (dir, app)
}

fn request(url: String) -> FetchRequest {
    FetchRequest {
        url,
        method: None,
        headers: None,
        body: None,
        reason: None,
    }
}

#[tokio::test]
async fn happy_path_settles_one_transaction() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();
    app.dispatch(
        "setRules",
        json!({ "maxPerTransaction": "5.00", "dailyCap": "50.00" }),
    )
    .await
    .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let outcome = app.broker.fetch(request(format!("{base}/paid"))).await.unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "premium weather data");
    let payment = outcome.payment.unwrap();
    assert_eq!(payment.amount, "0.1");
    assert_eq!(payment.pay_to, PAY_TO);
    assert_eq!(payment.tx_hash.as_deref(), Some("0xab12"));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);

    let doc = app.store.document().await;
    let wallet = doc.active().unwrap();
    assert_eq!(wallet.transactions.len(), 1);
    let record = &wallet.transactions[0];
    assert_eq!(record.status, TxStatus::Settled);
    assert_eq!(record.amount, "0.1");
    assert_eq!(record.network, "eip155:84532");
    assert_eq!(record.tx_hash.as_deref(), Some("0xab12"));
    assert_eq!(record.payee, PAY_TO);

    // The retry carried the payment under both header spellings, and the
    // payload round-trips to the authorized amount.
    let seen = upstream.seen.lock().unwrap();
    let retry = seen.last().unwrap();
    assert!(retry.contains_key("payment-signature"));
    let raw = Base64Bytes::from(retry.get("x-payment").unwrap().as_bytes())
        .decode()
        .unwrap();
    let payload: Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(payload["accepted"]["amount"], "100000");
    assert_eq!(payload["payload"]["authorization"]["value"], "100000");
    assert!(
        payload["payload"]["signature"]
            .as_str()
            .unwrap()
            .starts_with("0x")
    );
}

#[tokio::test]
async fn non_402_responses_pass_through_without_payment() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let outcome = app.broker.fetch(request(format!("{base}/free"))).await.unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "free content");
    assert!(outcome.payment.is_none());
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    assert!(app.store.document().await.active().unwrap().transactions.is_empty());
}

#[tokio::test]
async fn daily_cap_refuses_before_any_retry() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();
    app.dispatch("setRules", json!({ "dailyCap": "0.10" }))
        .await
        .unwrap();

    // 0.09 USDC already settled today.
    let record = app
        .ledger
        .add(NewTransaction {
            payee: PAY_TO.into(),
            service: "api.example.com".into(),
            amount: "0.09".into(),
            asset: SEPOLIA_USDC.into(),
            network: "eip155:84532".into(),
            tx_hash: None,
            status: TxStatus::Pending,
            reason: "earlier".into(),
        })
        .await
        .unwrap();
    app.ledger
        .update(&record.id, TxPatch::settled(Some("0x1".into())))
        .await
        .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let err = app
        .broker
        .fetch(request(format!("{base}/paid")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Rule(RuleError::OverDailyCap { .. })
    ));
    // Negotiation issued the probe, but no retry and no new ledger entry.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    assert_eq!(app.store.document().await.active().unwrap().transactions.len(), 1);
}

#[tokio::test]
async fn blocked_service_refuses_before_any_retry() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();
    // The mock upstream serves on the loopback host.
    app.dispatch("setRules", json!({ "blockedServices": ["127.0.0.1"] }))
        .await
        .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let err = app
        .broker
        .fetch(request(format!("{base}/paid")))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Rule(RuleError::Blocked { .. })));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    assert!(app.store.document().await.active().unwrap().transactions.is_empty());
}

#[tokio::test]
async fn network_guard_rejects_wrong_chain() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();
    // Wallet-side selection is mainnet; the offer is Sepolia-only.
    app.dispatch("setNetwork", json!({ "network": "base" }))
        .await
        .unwrap();

    let (base, _upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let err = app
        .broker
        .fetch(request(format!("{base}/paid")))
        .await
        .unwrap_err();
    match err {
        BrokerError::NetworkMismatch { selected, offered } => {
            assert_eq!(selected, "eip155:8453");
            assert_eq!(offered, "eip155:84532");
        }
        other => panic!("expected network mismatch, got {other}"),
    }
    assert!(app.store.document().await.active().unwrap().transactions.is_empty());
}

#[tokio::test]
async fn incompatible_offers_are_rejected() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();

    // Right chain, wrong token.
    let doc = json!({
        "x402Version": 1,
        "accepts": [{
            "scheme": "exact",
            "network": "eip155:84532",
            "asset": "0x4200000000000000000000000000000000000006",
            "amount": "100000",
            "payTo": PAY_TO,
            "maxTimeoutSeconds": 600,
        }]
    });
    let (base, _upstream) = spawn_upstream(doc).await;
    let err = app
        .broker
        .fetch(request(format!("{base}/paid")))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoCompatibleOption));
}

#[tokio::test]
async fn frozen_wallet_refuses_before_any_upstream_request() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();
    app.dispatch("freeze", Value::Null).await.unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let err = app
        .broker
        .fetch(request(format!("{base}/paid")))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Frozen));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    assert!(app.store.document().await.active().unwrap().transactions.is_empty());
}

#[tokio::test]
async fn two_phase_flow_settles_and_sessions_are_one_shot() {
    let (_dir, app) = broker_env().await;
    app.dispatch(
        "createWallet",
        json!({
            "adapter": "browser",
            "credentials": { "address": "0x3333333333333333333333333333333333333333" }
        }),
    )
    .await
    .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let descriptor = app
        .broker
        .prepare(request(format!("{base}/paid")))
        .await
        .unwrap();
    assert_eq!(descriptor.primary_type, "TransferWithAuthorization");
    assert_eq!(descriptor.human_amount, "0.1");
    assert_eq!(descriptor.network, "eip155:84532");
    assert_eq!(descriptor.message.value, "100000");
    assert_eq!(descriptor.domain["chainId"], 84532);

    // The pending entry exists before any signature.
    let doc = app.store.document().await;
    assert_eq!(doc.active().unwrap().transactions[0].status, TxStatus::Pending);

    let outcome = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(
        outcome.payment.as_ref().unwrap().tx_hash.as_deref(),
        Some("0xab12")
    );
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);

    let doc = app.store.document().await;
    assert_eq!(doc.active().unwrap().transactions[0].status, TxStatus::Settled);

    // Double submit.
    let err = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SessionNotFound));
}

#[tokio::test]
async fn concurrent_completes_settle_exactly_once() {
    let (_dir, app) = broker_env().await;
    app.dispatch(
        "createWallet",
        json!({
            "adapter": "browser",
            "credentials": { "address": "0x3333333333333333333333333333333333333333" }
        }),
    )
    .await
    .unwrap();

    let (base, _upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let descriptor = app
        .broker
        .prepare(request(format!("{base}/paid")))
        .await
        .unwrap();

    let first = {
        let app = app.clone();
        let session_id = descriptor.session_id.clone();
        tokio::spawn(async move { app.broker.complete(&session_id, SIGNATURE).await })
    };
    let second = {
        let app = app.clone();
        let session_id = descriptor.session_id.clone();
        tokio::spawn(async move { app.broker.complete(&session_id, SIGNATURE).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let not_found = results
        .iter()
        .filter(|r| matches!(r, Err(BrokerError::SessionNotFound)))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(not_found, 1);

    let doc = app.store.document().await;
    let settled = doc
        .active()
        .unwrap()
        .transactions
        .iter()
        .filter(|t| t.status == TxStatus::Settled)
        .count();
    assert_eq!(settled, 1);
}

#[tokio::test]
async fn freezing_after_prepare_pauses_completion() {
    let (_dir, app) = broker_env().await;
    app.dispatch(
        "createWallet",
        json!({
            "adapter": "browser",
            "credentials": { "address": "0x3333333333333333333333333333333333333333" }
        }),
    )
    .await
    .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let descriptor = app
        .broker
        .prepare(request(format!("{base}/paid")))
        .await
        .unwrap();

    // Kill-switch between prepare and complete: nothing may go upstream.
    app.dispatch("freeze", Value::Null).await.unwrap();
    let err = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Frozen));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    let doc = app.store.document().await;
    assert_eq!(doc.active().unwrap().transactions[0].status, TxStatus::Pending);

    // The session survives the refusal, so unfreezing lets it complete.
    app.dispatch("unfreeze", Value::Null).await.unwrap();
    let outcome = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    let doc = app.store.document().await;
    assert_eq!(doc.active().unwrap().transactions[0].status, TxStatus::Settled);
}

#[tokio::test]
async fn removing_the_wallet_after_prepare_refuses_completion() {
    let (_dir, app) = broker_env().await;
    let created = app
        .dispatch(
            "createWallet",
            json!({
                "adapter": "browser",
                "credentials": { "address": "0x3333333333333333333333333333333333333333" }
            }),
        )
        .await
        .unwrap();
    let wallet_id = created["id"].as_str().unwrap().to_string();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let descriptor = app
        .broker
        .prepare(request(format!("{base}/paid")))
        .await
        .unwrap();

    app.dispatch("removeWallet", json!({ "walletId": wallet_id }))
        .await
        .unwrap();

    // The wallet (and its pending entry) are gone; no retry may be issued.
    let err = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Store(StoreError::WalletNotFound(_))
    ));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    // The orphaned session was dropped with the wallet.
    let err = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SessionNotFound));
}

#[tokio::test]
async fn expired_sessions_are_swept_and_refused() {
    let (_dir, app) = broker_env().await;
    app.dispatch(
        "createWallet",
        json!({
            "adapter": "browser",
            "credentials": { "address": "0x3333333333333333333333333333333333333333" }
        }),
    )
    .await
    .unwrap();

    // validBefore = now + 1s.
    let (base, _upstream) = spawn_upstream(sepolia_doc("100000", 1)).await;
    let descriptor = app
        .broker
        .prepare(request(format!("{base}/paid")))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    app.broker.sweep_expired().await;

    let doc = app.store.document().await;
    let record = &doc.active().unwrap().transactions[0];
    assert_eq!(record.status, TxStatus::Failed);
    assert_eq!(record.reason, "Payment session expired");

    let err = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SessionNotFound));
}

#[tokio::test]
async fn complete_after_expiry_fails_the_ledger_entry() {
    let (_dir, app) = broker_env().await;
    app.dispatch(
        "createWallet",
        json!({
            "adapter": "browser",
            "credentials": { "address": "0x3333333333333333333333333333333333333333" }
        }),
    )
    .await
    .unwrap();

    let (base, _upstream) = spawn_upstream(sepolia_doc("100000", 1)).await;
    let descriptor = app
        .broker
        .prepare(request(format!("{base}/paid")))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    // No sweeper run; complete itself observes the expiry.
    let err = app
        .broker
        .complete(&descriptor.session_id, SIGNATURE)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SessionNotFound));

    let doc = app.store.document().await;
    let record = &doc.active().unwrap().transactions[0];
    assert_eq!(record.status, TxStatus::Failed);
    assert_eq!(record.reason, "Payment session expired");
}

#[tokio::test]
async fn agent_identity_headers_ride_on_the_retry() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();
    app.dispatch(
        "setAgentIdentity",
        json!({
            "name": "concierge",
            "agentId": "42",
            "agentRegistry": "eip155:84532:0x9999999999999999999999999999999999999999"
        }),
    )
    .await
    .unwrap();

    let (base, upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    app.broker.fetch(request(format!("{base}/paid"))).await.unwrap();

    let seen = upstream.seen.lock().unwrap();
    let probe = &seen[0];
    assert!(!probe.contains_key("x-agent-id"));
    let retry = seen.last().unwrap();
    assert_eq!(retry.get("x-agent-id").unwrap(), "42");
    assert_eq!(
        retry.get("x-agent-registry").unwrap(),
        "eip155:84532:0x9999999999999999999999999999999999999999"
    );
    assert_eq!(retry.get("x-agent-name").unwrap(), "concierge");
}

#[tokio::test]
async fn pay_operation_returns_the_normalized_envelope() {
    let (_dir, app) = broker_env().await;
    app.dispatch("createWallet", json!({ "adapter": "local-key" }))
        .await
        .unwrap();

    let (base, _upstream) = spawn_upstream(sepolia_doc("100000", 600)).await;
    let envelope = app
        .dispatch("pay", json!({ "url": format!("{base}/paid"), "reason": "weather" }))
        .await
        .unwrap();
    assert_eq!(envelope["status"], 200);
    assert_eq!(envelope["payment"]["amount"], "0.1");
    assert!(envelope.get("error").is_none());

    let doc = app.store.document().await;
    assert_eq!(doc.active().unwrap().transactions[0].reason, "weather");

    // Pre-retry failures surface as status 0 with the error in band.
    app.dispatch("setRules", json!({ "maxPerTransaction": "0.05" }))
        .await
        .unwrap();
    let envelope = app
        .dispatch("pay", json!({ "url": format!("{base}/paid") }))
        .await
        .unwrap();
    assert_eq!(envelope["status"], 0);
    assert_eq!(envelope["body"], Value::Null);
    assert_eq!(envelope["payment"], Value::Null);
    assert!(
        envelope["error"]
            .as_str()
            .unwrap()
            .contains("per-transaction limit")
    );
}
