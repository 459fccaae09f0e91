//! Escrow-payment coordinator core.
//!
//! The blockchain synchronization and state-transition engine: chain
//! adapter, persistence layer, the sync loop that reconstructs escrow state
//! from on-chain datums, and the action dispatchers that author
//! transactions. The HTTP surface, wallet provisioning and observability
//! stack live in sibling services and consume this crate.

pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod services;
pub mod telemetry;
