pub mod account;
pub mod export;

use std::sync::Arc;

use anyhow::Context;
use geoflip_core::ledger::JobLedger;
use geoflip_core::store::FileStore;
use geoflip_events::{EventBus, TrackerEvent};
use geoflip_transform::api::GeoflipApi;
use geoflip_transform::session::Session;
use geoflip_transform::tracker::ExportTracker;

use crate::config::ClientConfig;

/// Everything a command needs: configuration, the state file, the session
/// and the event bus.
pub struct App {
    pub config: ClientConfig,
    pub ledger: JobLedger,
    pub events: EventBus,
    pub session: Session,
}

impl App {
    pub fn open(config: ClientConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            FileStore::open(&config.state_path)
                .with_context(|| format!("Failed to open {}", config.state_path.display()))?,
        );
        let events = EventBus::default();
        let session = Session::restore(
            GeoflipApi::new(config.api_url.clone()),
            store.clone(),
            events.clone(),
        )?;

        Ok(Self {
            config,
            ledger: JobLedger::new(store),
            events,
            session,
        })
    }

    /// A tracker using the current session's token.
    pub fn tracker(&self) -> ExportTracker {
        ExportTracker::new(
            Arc::new(self.session.api().clone()),
            self.ledger.clone(),
            self.events.clone(),
            self.config.poll.clone(),
        )
    }
}

/// Print a tracker event for the user. Notices go to stderr.
pub fn print_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::JobRegistered { job, state } => {
            println!("{}  {}  registered ({state})", job.task_id, job.name);
        }
        TrackerEvent::JobProgress { task_id, message } => println!("{task_id}  {message}"),
        TrackerEvent::JobSucceeded { task_id, output_url } => {
            println!("{task_id}  ready: {output_url}");
        }
        TrackerEvent::JobFailed { task_id, message } => println!("{task_id}  {message}"),
        TrackerEvent::PollingAbandoned {
            task_id,
            consecutive_errors,
        } => println!("{task_id}  gave up after {consecutive_errors} failed checks"),
        TrackerEvent::JobDownloaded { task_id, path } => {
            println!("{task_id}  saved to {}", path.display());
        }
        TrackerEvent::JobRemoved { task_id } => println!("{task_id}  removed"),
        TrackerEvent::SessionExpired => {
            eprintln!("Your session has expired. Please login again.");
        }
        TrackerEvent::Notice { task_id, notice } => match task_id {
            Some(id) => eprintln!("{id}  {notice}"),
            None => eprintln!("{notice}"),
        },
    }
}
