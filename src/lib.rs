//! Crypto checkout service core.
//!
//! Merchants create invoices denominated in fiat; customers pay in USDT on
//! Tron; the platform confirms payments on-chain, settles proceeds net of a
//! platform fee, and delivers ordered, signed webhook notifications.
//!
//! # Architecture
//!
//! State changes are event-sourced: every aggregate owns an append-only,
//! version-gated stream in the [`event_store`], and committed events are
//! published to a topic-partitioned bus through the [`event_bus`] with an
//! outbox sweep guaranteeing eventual publication. The pure aggregate logic
//! lives in the `checkout-types` crate; this crate supplies the services,
//! stores, delivery engine, and HTTP surface around it.
//!
//! # Modules
//!
//! - [`auth`] — API-key-to-JWT exchange and bearer authentication.
//! - [`config`] — JSON-file plus environment configuration.
//! - [`credentials`] — digest-keyed API-key storage.
//! - [`error`] — the JSON error envelope.
//! - [`event_bus`] — topic routing, publication, outbox reconciliation.
//! - [`event_store`] — the append-only per-aggregate event log.
//! - [`handlers`] — axum HTTP endpoints.
//! - [`services`] — merchant, key, invoice, payment, matcher, and settlement
//!   services.
//! - [`sig_down`] — SIGTERM/SIGINT handling.
//! - [`sweeper`] — periodic background singletons.
//! - [`telemetry`] — tracing and OpenTelemetry setup.
//! - [`webhook_delivery`] — the per-endpoint delivery engine.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event_bus;
pub mod event_store;
pub mod handlers;
pub mod services;
pub mod sig_down;
pub mod sweeper;
pub mod telemetry;
pub mod webhook_delivery;
