//! Local-first spend-control broker for the [x402 protocol](https://www.x402.org).
//!
//! An autonomous agent (or a human behind a dashboard) asks this broker to
//! fetch a URL. The broker performs the `402 Payment Required` handshake,
//! enforces the active wallet's spending rules, signs an ERC-3009
//! `TransferWithAuthorization` through a pluggable wallet adapter, retries
//! the request with the signed authorization, records the outcome in a
//! per-wallet ledger, and hands the upstream response back.
//!
//! # Modules
//!
//! - [`network`] — Supported chains, CAIP-2 mapping, and known USDC deployments.
//! - [`store`] — The persistent multi-wallet document with atomic durability
//!   and migration from the single-wallet predecessor schema.
//! - [`ledger`] — Append-only transaction records bound to a wallet.
//! - [`rules`] — Per-transaction limit, daily cap, allowlist and blocklist.
//! - [`adapter`] — The uniform wallet contract over self-custodial, managed,
//!   and externally-signing variants.
//! - [`manager`] — Wallet lifecycle: create, switch, remove, freeze, identity.
//! - [`broker`] — x402 negotiation, the single-shot and two-phase payment
//!   flows, and the payment-session sweeper.
//! - [`proto`] — x402 wire types and EIP-712 material for USDC.
//! - [`erc20`] — Balance queries over JSON-RPC.
//! - [`tools`] — The operation catalog consumed by both bindings.
//! - [`handlers`] — The JSON-over-HTTP binding (axum).
//! - [`rpc`] — The stdio tool-protocol binding for agent runtimes.

pub mod adapter;
pub mod amount;
pub mod broker;
pub mod erc20;
pub mod handlers;
pub mod ledger;
pub mod manager;
pub mod network;
pub mod proto;
pub mod rpc;
pub mod rules;
pub mod shutdown;
pub mod store;
pub mod timestamp;
pub mod tools;
pub mod util;
