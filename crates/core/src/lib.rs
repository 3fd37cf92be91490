//! Domain types for the Geoflip export tracker.
//!
//! Everything here is synchronous and free of network concerns: job records
//! and their state machine, the durable ledger, the key/value store contract,
//! and the session reducer.

pub mod auth;
pub mod error;
pub mod export;
pub mod ledger;
pub mod store;
pub mod types;
