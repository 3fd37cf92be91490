//! Geoflip transformation client and export job tracker.
//!
//! - [`api::GeoflipApi`]: REST client for submission, status and output.
//! - [`tracker::ExportTracker`]: per-job polling backed by the durable
//!   [`geoflip_core::ledger::JobLedger`].
//! - [`session::Session`]: account login state and the monthly allowance.
//! - [`completion`]: submit-and-wait for results used in place.

pub mod api;
pub mod backoff;
pub mod completion;
pub mod request;
pub mod service;
pub mod session;
pub mod tracker;

pub use api::{ApiError, GeoflipApi};
pub use backoff::PollConfig;
pub use service::TransformService;
pub use tracker::{ExportTracker, TrackerError};
