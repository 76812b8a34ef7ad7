//! Domain types for the checkout platform.
//!
//! This crate holds the pure half of the system: money and identifiers, the
//! domain event envelope, and the aggregates (merchant, API key, webhook
//! endpoint, invoice, payment, settlement) with their state machines.
//! Aggregate logic is expressed as `(state, command) -> events` functions
//! plus `apply`/replay, so everything here is directly testable without I/O.
//!
//! # Modules
//!
//! - [`money`] — currency-tagged exact decimal arithmetic.
//! - [`id`] — typed UUID identifiers.
//! - [`event`] — event envelope, metadata, and the event-type registry.
//! - [`merchant`] — merchant identity, settings, status transitions.
//! - [`api_key`] — key format, permission scopes, key records.
//! - [`webhook`] — endpoint subscriptions and delivery policy.
//! - [`invoice`] — pricing, expiration, tolerance policy, status machine.
//! - [`payment`] — per-transaction lifecycle and confirmation policy.
//! - [`settlement`] — platform fee bookkeeping.

pub mod api_key;
pub mod event;
pub mod id;
pub mod invoice;
pub mod merchant;
pub mod money;
pub mod payment;
pub mod settlement;
pub mod webhook;
