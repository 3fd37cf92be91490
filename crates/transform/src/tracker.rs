//! Export job tracker.
//!
//! [`ExportTracker`] owns the in-memory export list, mirrors every job into
//! the durable [`JobLedger`], and runs one polling task per job that is still
//! `PROCESSING`. Polling stops when the job reaches a terminal state, when
//! the job is downloaded or removed, or when the error allowance of the
//! [`PollConfig`] is used up.
//!
//! State changes and user-facing notices are published on the shared
//! [`EventBus`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use geoflip_core::error::CoreError;
use geoflip_core::export::{ExportJob, JobRecord, JobState};
use geoflip_core::ledger::JobLedger;
use geoflip_core::types::TaskId;
use geoflip_events::notice::{
    Notice, MSG_DOWNLOAD_EXPIRED, MSG_POLLING_ABANDONED, MSG_PROCESSING,
    MSG_STATUS_CHECK_FAILED, MSG_TASK_FAILED, MSG_USAGE_NOT_RECORDED,
};
use geoflip_events::{EventBus, TrackerEvent};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, StatusOutcome};
use crate::backoff::PollConfig;
use crate::request::TransformRequest;
use crate::service::TransformService;

/// How long [`ExportTracker::shutdown`] waits for each poller to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors from tracker operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Export {0} is not tracked")]
    NotFound(TaskId),

    #[error("Export {task_id} is not ready for download (state {state})")]
    NotReady { task_id: TaskId, state: JobState },

    #[error("Download link for export {task_id} has expired: {source}")]
    DownloadExpired {
        task_id: TaskId,
        #[source]
        source: ApiError,
    },

    #[error("Failed to save export to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the user can do with a job right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Still processing; nothing to do but wait.
    Wait,
    /// Output is ready.
    Download,
    /// The job failed; it can only be removed.
    Remove,
    /// Polling gave up; it can be resumed or removed.
    Resume,
}

/// Snapshot of one entry of the export list.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job: ExportJob,
    pub state: JobState,
    /// Latest status line.
    pub message: String,
    pub output_url: Option<String>,
    /// Polling stopped after repeated errors.
    pub abandoned: bool,
}

impl JobView {
    pub fn action(&self) -> JobAction {
        match self.state {
            JobState::Success => JobAction::Download,
            JobState::Failure => JobAction::Remove,
            JobState::Processing if self.abandoned => JobAction::Resume,
            JobState::Processing => JobAction::Wait,
        }
    }
}

/// Bookkeeping for a running poll task.
struct Poller {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct TrackerInner {
    service: Arc<dyn TransformService>,
    ledger: JobLedger,
    events: EventBus,
    config: PollConfig,
    /// In-memory export list, in registration order.
    jobs: RwLock<Vec<JobView>>,
    pollers: Mutex<HashMap<TaskId, Poller>>,
    /// Serializes ledger writes from pollers against removal.
    ledger_lock: Mutex<()>,
    /// Parent of every poller's token; cancelled on shutdown.
    cancel: CancellationToken,
}

/// Tracks export jobs from submission to download or removal.
///
/// Cloning yields another handle to the same tracker.
#[derive(Clone)]
pub struct ExportTracker {
    inner: Arc<TrackerInner>,
}

/// Result of one status request.
enum PollStep {
    Processing(Option<String>),
    Success(String),
    Failure(Option<String>),
    Error(ApiError),
}

impl ExportTracker {
    pub fn new(
        service: Arc<dyn TransformService>,
        ledger: JobLedger,
        events: EventBus,
        config: PollConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                service,
                ledger,
                events,
                config,
                jobs: RwLock::new(Vec::new()),
                pollers: Mutex::new(HashMap::new()),
                ledger_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Submit a transformation and start tracking the resulting job.
    ///
    /// Failures are published as notices and returned to the caller; an
    /// expired session additionally publishes [`TrackerEvent::SessionExpired`].
    pub async fn submit(
        &self,
        name: &str,
        request: &TransformRequest,
    ) -> Result<TaskId, TrackerError> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("Export name must not be empty".into()).into());
        }
        request.validate()?;

        let task_id = match self.inner.service.submit(request).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(name, error = %e, "Transformation submission failed");
                if e.is_unauthorized() {
                    self.inner.events.publish(TrackerEvent::SessionExpired);
                }
                self.inner.events.notify(None, Notice::error(e.user_message()));
                return Err(e.into());
            }
        };

        tracing::info!(
            task_id = %task_id,
            name,
            format = request.output_format(),
            "Export job accepted"
        );

        self.track(ExportJob::new(task_id.clone(), name, request.output_format()))
            .await?;
        Ok(task_id)
    }

    /// Start tracking a job the service has already accepted.
    ///
    /// The ledger's existing record wins over a fresh one, so a job reloaded
    /// in a terminal state is surfaced without polling. Returns the state in
    /// effect.
    pub async fn track(&self, job: ExportJob) -> Result<JobState, TrackerError> {
        let record = {
            let _guard = self.inner.ledger_lock.lock().await;
            self.inner.ledger.register(&job)?
        };

        let view = JobView {
            job: job.clone(),
            state: record.state,
            message: match record.state {
                JobState::Processing => MSG_PROCESSING.to_string(),
                JobState::Success => String::new(),
                JobState::Failure => MSG_TASK_FAILED.to_string(),
            },
            output_url: record.download_url().map(str::to_string),
            abandoned: false,
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.iter_mut().find(|v| v.job.task_id == job.task_id) {
                Some(existing) => *existing = view,
                None => jobs.push(view),
            }
        }

        self.inner.events.publish(TrackerEvent::JobRegistered {
            job: job.clone(),
            state: record.state,
        });

        match record.state {
            JobState::Processing => self.inner.spawn_poller(job).await,
            JobState::Success => {
                if let Some(url) = record.download_url() {
                    self.inner.events.publish(TrackerEvent::JobSucceeded {
                        task_id: job.task_id.clone(),
                        output_url: url.to_string(),
                    });
                }
            }
            JobState::Failure => self.inner.events.publish(TrackerEvent::JobFailed {
                task_id: job.task_id.clone(),
                message: MSG_TASK_FAILED.to_string(),
            }),
        }

        Ok(record.state)
    }

    /// Reload every pending job from the ledger.
    ///
    /// Jobs already being tracked are left alone. Returns the jobs that were
    /// (re)registered.
    pub async fn restore(&self) -> Result<Vec<ExportJob>, TrackerError> {
        let pending = self.inner.ledger.pending_jobs()?;
        let mut restored = Vec::with_capacity(pending.len());

        for (job, _) in pending {
            if self.is_tracked(&job.task_id).await {
                continue;
            }
            self.track(job.clone()).await?;
            restored.push(job);
        }

        tracing::info!(count = restored.len(), "Restored pending export jobs");
        Ok(restored)
    }

    /// Fetch a finished export and save it under `dest_dir`.
    ///
    /// On success the job is cleared and the saved path returned. If the
    /// download link no longer works the job is cleared anyway and
    /// [`TrackerError::DownloadExpired`] is returned.
    pub async fn download(&self, task_id: &str, dest_dir: &Path) -> Result<PathBuf, TrackerError> {
        let record = self
            .inner
            .ledger
            .record(task_id)?
            .ok_or_else(|| TrackerError::NotFound(task_id.to_string()))?;

        let Some(url) = record.download_url() else {
            return Err(TrackerError::NotReady {
                task_id: task_id.to_string(),
                state: record.state,
            });
        };

        let bytes = match self.inner.service.fetch_output(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Export download failed, clearing job");
                self.inner
                    .events
                    .notify(Some(task_id), Notice::error(MSG_DOWNLOAD_EXPIRED));
                self.remove(task_id).await?;
                return Err(TrackerError::DownloadExpired {
                    task_id: task_id.to_string(),
                    source: e,
                });
            }
        };

        let job = record.to_export_job(task_id);
        let path = dest_dir.join(job.download_file_name());
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| TrackerError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| TrackerError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::info!(task_id, path = %path.display(), bytes = bytes.len(), "Export downloaded");

        self.clear(task_id).await?;
        self.inner.events.publish(TrackerEvent::JobDownloaded {
            task_id: task_id.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }

    /// Stop polling and delete the job from the list and the ledger.
    ///
    /// Removing an unknown id is a no-op.
    pub async fn remove(&self, task_id: &str) -> Result<(), TrackerError> {
        if self.clear(task_id).await? {
            self.inner.events.publish(TrackerEvent::JobRemoved {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Restart polling for a job whose poller gave up.
    ///
    /// Returns `false` if the job is unknown, terminal, or already polling.
    pub async fn resume(&self, task_id: &str) -> Result<bool, TrackerError> {
        let job = {
            let mut jobs = self.inner.jobs.write().await;
            let Some(view) = jobs.iter_mut().find(|v| v.job.task_id == task_id) else {
                return Ok(false);
            };
            if view.state.is_terminal() {
                return Ok(false);
            }
            view.abandoned = false;
            view.job.clone()
        };

        if self.is_polling(task_id).await {
            return Ok(false);
        }

        tracing::info!(task_id, "Resuming export polling");
        self.inner.spawn_poller(job).await;
        Ok(true)
    }

    /// Snapshot of the export list.
    pub async fn jobs(&self) -> Vec<JobView> {
        self.inner.jobs.read().await.clone()
    }

    /// Snapshot of one export.
    pub async fn job(&self, task_id: &str) -> Option<JobView> {
        self.inner
            .jobs
            .read()
            .await
            .iter()
            .find(|v| v.job.task_id == task_id)
            .cloned()
    }

    /// Whether a poll task for `task_id` is alive.
    pub async fn is_polling(&self, task_id: &str) -> bool {
        self.inner
            .pollers
            .lock()
            .await
            .get(task_id)
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Number of live poll tasks.
    pub async fn active_pollers(&self) -> usize {
        self.inner
            .pollers
            .lock()
            .await
            .values()
            .filter(|p| !p.handle.is_finished())
            .count()
    }

    /// Cancel every poller and wait briefly for each to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down export tracker");
        self.inner.cancel.cancel();

        let pollers: Vec<_> = self.inner.pollers.lock().await.drain().collect();
        for (task_id, poller) in pollers {
            tracing::debug!(task_id = %task_id, "Stopping poll task");
            poller.cancel.cancel();
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, poller.handle).await;
        }
    }

    // ---- private helpers ----

    async fn is_tracked(&self, task_id: &str) -> bool {
        self.inner
            .jobs
            .read()
            .await
            .iter()
            .any(|v| v.job.task_id == task_id)
    }

    /// Cancel polling and forget the job everywhere. Returns whether the job
    /// existed in memory or in the ledger.
    async fn clear(&self, task_id: &str) -> Result<bool, TrackerError> {
        let _guard = self.inner.ledger_lock.lock().await;

        if let Some(poller) = self.inner.pollers.lock().await.remove(task_id) {
            poller.cancel.cancel();
        }

        let in_memory = {
            let mut jobs = self.inner.jobs.write().await;
            let before = jobs.len();
            jobs.retain(|v| v.job.task_id != task_id);
            jobs.len() != before
        };

        let in_ledger = self.inner.ledger.forget(task_id)?;
        Ok(in_memory || in_ledger)
    }
}

impl TrackerInner {
    /// Spawn the poll task for `job`, replacing any previous one.
    async fn spawn_poller(self: &Arc<Self>, job: ExportJob) {
        let cancel = self.cancel.child_token();
        let inner = Arc::clone(self);
        let task_cancel = cancel.clone();
        let task_id = job.task_id.clone();

        let handle = tokio::spawn(async move {
            tracing::debug!(task_id = %job.task_id, "Starting poll task");
            inner.poll_job(&job, &task_cancel).await;
            tracing::debug!(task_id = %job.task_id, "Poll task exited");
        });

        let mut pollers = self.pollers.lock().await;
        pollers.retain(|_, p| !p.handle.is_finished());
        if let Some(previous) = pollers.insert(task_id, Poller { handle, cancel }) {
            previous.cancel.cancel();
        }
    }

    /// Poll loop for one job: wait, check stored state, query, react.
    async fn poll_job(&self, job: &ExportJob, cancel: &CancellationToken) {
        let task_id = job.task_id.as_str();
        let mut consecutive_errors = 0u32;
        let mut delay = self.config.initial_delay;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // A terminal state already in the ledger short-circuits the
            // network round trip.
            match self.ledger.record(task_id) {
                Ok(Some(record)) if record.state.is_terminal() => {
                    self.publish_terminal(task_id, &record, None).await;
                    return;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(task_id, "Export record vanished, stopping poll");
                    return;
                }
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Failed to read export record");
                }
            }

            let step = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.service.status(task_id) => classify(result),
            };

            let error = match step {
                PollStep::Processing(message) => {
                    consecutive_errors = 0;
                    let message = message.unwrap_or_else(|| MSG_PROCESSING.to_string());
                    tracing::debug!(task_id, message = %message, "Export still processing");
                    self.update_view(task_id, |v| v.message = message.clone())
                        .await;
                    self.events.publish(TrackerEvent::JobProgress {
                        task_id: task_id.to_string(),
                        message,
                    });
                    delay = self.config.interval;
                    continue;
                }
                PollStep::Success(output_url) => {
                    match self.finish(job, cancel, |r| r.succeed(output_url), None).await {
                        Ok(()) => return,
                        Err(e) => e.to_string(),
                    }
                }
                PollStep::Failure(message) => {
                    match self.finish(job, cancel, JobRecord::fail, message).await {
                        Ok(()) => return,
                        Err(e) => e.to_string(),
                    }
                }
                PollStep::Error(e) => e.to_string(),
            };

            consecutive_errors += 1;
            tracing::warn!(
                task_id,
                error = %error,
                consecutive_errors,
                "Export status check failed",
            );
            self.events
                .notify(Some(task_id), Notice::error(MSG_STATUS_CHECK_FAILED));

            if self.config.exhausted(consecutive_errors) {
                tracing::error!(task_id, consecutive_errors, "Abandoning export polling");
                self.update_view(task_id, |v| v.abandoned = true).await;
                self.events
                    .notify(Some(task_id), Notice::warning(MSG_POLLING_ABANDONED));
                self.events.publish(TrackerEvent::PollingAbandoned {
                    task_id: task_id.to_string(),
                    consecutive_errors,
                });
                return;
            }
            delay = self.config.delay_after(consecutive_errors);
        }
    }

    /// Persist a terminal transition and surface it.
    ///
    /// The list entry only turns terminal once the record is stored. A
    /// failed write is returned so the poller retries it on its error
    /// backoff.
    async fn finish(
        &self,
        job: &ExportJob,
        cancel: &CancellationToken,
        transition: impl FnOnce(JobRecord) -> Result<JobRecord, CoreError>,
        server_message: Option<String>,
    ) -> Result<(), CoreError> {
        let task_id = job.task_id.as_str();
        let _guard = self.ledger_lock.lock().await;
        if cancel.is_cancelled() {
            return Ok(());
        }

        let current = match self.ledger.record(task_id) {
            Ok(Some(record)) => record,
            Ok(None) => JobRecord::processing(job.name.clone(), job.output_format.clone()),
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Failed to read export record");
                JobRecord::processing(job.name.clone(), job.output_format.clone())
            }
        };

        let next = match transition(current.clone()) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Ignoring conflicting job status");
                self.publish_terminal(task_id, &current, None).await;
                return Ok(());
            }
        };

        if let Err(e) = self.ledger.write_record(task_id, &next) {
            tracing::error!(task_id, error = %e, "Failed to persist export state");
            return Err(e);
        }

        tracing::info!(task_id, state = %next.state, "Export job finished");
        self.publish_terminal(task_id, &next, server_message).await;
        if next.state == JobState::Failure {
            self.events
                .notify(Some(task_id), Notice::info(MSG_USAGE_NOT_RECORDED));
        }
        Ok(())
    }

    /// Update the list entry and publish the terminal event for `record`.
    async fn publish_terminal(&self, task_id: &str, record: &JobRecord, detail: Option<String>) {
        let url = record.download_url().map(str::to_string);
        let state = record.state;
        self.update_view(task_id, |v| {
            v.state = state;
            v.output_url = url.clone();
            v.message = match state {
                JobState::Failure => MSG_TASK_FAILED.to_string(),
                _ => String::new(),
            };
        })
        .await;

        match (state, url) {
            (JobState::Success, Some(output_url)) => {
                self.events.publish(TrackerEvent::JobSucceeded {
                    task_id: task_id.to_string(),
                    output_url,
                });
            }
            (JobState::Failure, _) => {
                if let Some(detail) = detail {
                    tracing::info!(task_id, detail = %detail, "Service reported failure");
                }
                self.events.publish(TrackerEvent::JobFailed {
                    task_id: task_id.to_string(),
                    message: MSG_TASK_FAILED.to_string(),
                });
            }
            _ => {}
        }
    }

    async fn update_view(&self, task_id: &str, f: impl FnOnce(&mut JobView)) {
        let mut jobs = self.jobs.write().await;
        if let Some(view) = jobs.iter_mut().find(|v| v.job.task_id == task_id) {
            f(view);
        }
    }
}

fn classify(result: Result<crate::api::JobStatus, ApiError>) -> PollStep {
    let status = match result {
        Ok(status) => status,
        Err(e) => return PollStep::Error(e),
    };
    match status.outcome() {
        Ok(StatusOutcome::Processing) => PollStep::Processing(status.message.clone()),
        Ok(StatusOutcome::Success { output_url }) => PollStep::Success(output_url.to_string()),
        Ok(StatusOutcome::Failure) => PollStep::Failure(status.message.clone()),
        Err(e) => PollStep::Error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(state: JobState, abandoned: bool) -> JobView {
        JobView {
            job: ExportJob::new("t", "n", "shp"),
            state,
            message: String::new(),
            output_url: None,
            abandoned,
        }
    }

    #[test]
    fn actions_follow_state() {
        assert_eq!(view(JobState::Processing, false).action(), JobAction::Wait);
        assert_eq!(view(JobState::Processing, true).action(), JobAction::Resume);
        assert_eq!(view(JobState::Success, false).action(), JobAction::Download);
        assert_eq!(view(JobState::Failure, false).action(), JobAction::Remove);
    }

    #[test]
    fn classify_maps_statuses() {
        use crate::api::JobStatus;

        assert!(matches!(
            classify(Ok(JobStatus::processing(Some("STARTED")))),
            PollStep::Processing(Some(m)) if m == "STARTED"
        ));
        assert!(matches!(
            classify(Ok(JobStatus::success("https://x"))),
            PollStep::Success(url) if url == "https://x"
        ));
        assert!(matches!(classify(Ok(JobStatus::failure())), PollStep::Failure(None)));
        assert!(matches!(
            classify(Err(ApiError::InvalidResponse("x".into()))),
            PollStep::Error(_)
        ));
    }
}
