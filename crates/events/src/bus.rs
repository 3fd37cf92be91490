//! Tracker events and the broadcast bus that carries them.
//!
//! The tracker, the session and any front end hold clones of one
//! [`EventBus`]; every clone shares the same channel.

use std::path::PathBuf;

use geoflip_core::export::{ExportJob, JobState};
use geoflip_core::types::TaskId;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::notice::Notice;

// ---------------------------------------------------------------------------
// TrackerEvent
// ---------------------------------------------------------------------------

/// Something that happened to an export job or the session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// A job entered the in-memory list, either fresh or reloaded from the
    /// ledger with its last known state.
    JobRegistered { job: ExportJob, state: JobState },

    /// A poll returned a non-terminal status.
    JobProgress { task_id: TaskId, message: String },

    /// The job finished and its output can be downloaded.
    JobSucceeded { task_id: TaskId, output_url: String },

    /// The service reported the job as failed. Usage was not recorded.
    JobFailed { task_id: TaskId, message: String },

    /// Polling stopped after too many consecutive errors.
    PollingAbandoned {
        task_id: TaskId,
        consecutive_errors: u32,
    },

    /// The output was saved locally and the job was cleared.
    JobDownloaded { task_id: TaskId, path: PathBuf },

    /// The job was cleared from the list and the ledger.
    JobRemoved { task_id: TaskId },

    /// The server rejected the session token; local auth state was cleared.
    SessionExpired,

    /// A user-facing message, optionally tied to one job.
    Notice {
        task_id: Option<TaskId>,
        notice: Notice,
    },
}

impl TrackerEvent {
    /// Task id the event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::JobRegistered { job, .. } => Some(&job.task_id),
            Self::JobProgress { task_id, .. }
            | Self::JobSucceeded { task_id, .. }
            | Self::JobFailed { task_id, .. }
            | Self::PollingAbandoned { task_id, .. }
            | Self::JobDownloaded { task_id, .. }
            | Self::JobRemoved { task_id } => Some(task_id),
            Self::Notice { task_id, .. } => task_id.as_deref(),
            Self::SessionExpired => None,
        }
    }

    /// Whether this event ends polling for its job.
    pub fn ends_polling(&self) -> bool {
        matches!(
            self,
            Self::JobSucceeded { .. }
                | Self::JobFailed { .. }
                | Self::PollingAbandoned { .. }
                | Self::JobDownloaded { .. }
                | Self::JobRemoved { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Events buffered per receiver before the oldest are overwritten.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out channel for [`TrackerEvent`]s.
///
/// # Usage
///
/// ```rust
/// use geoflip_events::bus::{EventBus, TrackerEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(TrackerEvent::SessionExpired);
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events. A receiver that falls further
    /// behind gets `RecvError::Lagged` and skips ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send `event` to every live receiver; dropped when nobody listens.
    pub fn publish(&self, event: TrackerEvent) {
        tracing::trace!(?event, "Publishing tracker event");
        let _ = self.sender.send(event);
    }

    /// Publish a notice tied to `task_id`.
    pub fn notify(&self, task_id: Option<&str>, notice: Notice) {
        self.publish(TrackerEvent::Notice {
            task_id: task_id.map(str::to_string),
            notice,
        });
    }

    /// New receiver seeing events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
