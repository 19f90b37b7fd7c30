//! Unified payment gateway over two settlement rails.
//!
//! `railgate` fronts a card processor (webhook-driven, sessioned) and a
//! Solana SPL-token rail speaking the HTTP 402 flow, behind one API for
//! products, quotes, verification, carts, refunds, and subscriptions.
//!
//! # Architecture
//!
//! The [`pipeline`] module owns the payment authorization state machine and
//! is the single write path to the payment ledger. Around it:
//!
//! - [`money`] / [`coupon`] - exact integer price arithmetic and stacked
//!   discounts,
//! - [`quote`] - signed, time-bounded payment requirements for resources
//!   and carts,
//! - [`rail`] - per-rail verification capabilities ([`rail::card`],
//!   [`rail::chain`]) dispatched dynamically,
//! - [`gasless`] / [`wallet`] - fee-sponsored transactions from a monitored
//!   hot-wallet pool,
//! - [`ledger`] - payments, refunds, subscriptions, coupon counters, with
//!   in-memory and Postgres backends,
//! - [`idempotency`] / [`nonce`] / [`signature`] - the replay-protected
//!   request layer,
//! - [`subscription`] - rail-agnostic period math and lifecycle,
//! - [`handlers`] - the HTTP surface, [`error`] - the taxonomy every
//!   response speaks.

pub mod api_key;
pub mod api_version;
pub mod catalog;
pub mod config;
pub mod coupon;
pub mod discovery;
pub mod error;
pub mod gasless;
pub mod handlers;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod money;
pub mod nonce;
pub mod pipeline;
pub mod quote;
pub mod rail;
pub mod refund;
pub mod signature;
pub mod subscription;
pub mod telemetry;
pub mod tenancy;
pub mod timestamp;
pub mod trace_id;
pub mod util;
pub mod wallet;
