//! Unattended grid-trading agent for a single spot instrument.
//!
//! The core is the position and order reconciliation engine in
//! [`position`]: every order lifecycle event, whether streamed live or
//! replayed from the venue's open-order listing, flows through one
//! idempotent state machine backed by durable snapshots. Around it sit the
//! stream supervisor, the REST venue transport, the balance cache, the
//! periodic reconciliation pass, and the band-based entry trigger.

pub mod balance;
pub mod config;
pub mod events;
pub mod persist;
pub mod position;
pub mod reconcile;
pub mod stream;
pub mod trigger;
pub mod types;
pub mod venue;
