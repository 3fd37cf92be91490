//! Geoflip tracker event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`TrackerEvent`]: state changes of individual export jobs plus
//!   user-facing [`Notice`]s that replace the dashboard's toasts.

pub mod bus;
pub mod notice;

pub use bus::{EventBus, TrackerEvent};
pub use notice::{Notice, NoticeLevel};
