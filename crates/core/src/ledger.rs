//! Durable export job ledger.
//!
//! The ledger keeps two kinds of entries in a [`KeyValueStore`]:
//!
//! - one JSON [`JobRecord`] per job, stored under the job's task id;
//! - the pending index under [`EXPORT_JOBS_KEY`], a JSON array of task ids.
//!
//! Ids enter the index when a job is registered and leave it when the job
//! is forgotten (downloaded or removed). Every index update reads the whole
//! array, mutates it, and writes it back.

use std::sync::Arc;

use crate::error::CoreError;
use crate::export::{ExportJob, JobRecord};
use crate::store::KeyValueStore;
use crate::types::TaskId;

/// Store key holding the array of pending task ids.
pub const EXPORT_JOBS_KEY: &str = "exportJobs";

/// Store key holding the serialized session (see [`crate::auth`]).
pub const AUTH_STATE_KEY: &str = "authState";

/// Keys that can never be used as task ids.
const RESERVED_KEYS: &[&str] = &[EXPORT_JOBS_KEY, AUTH_STATE_KEY];

/// Handle to the durable job ledger. Cheap to clone.
#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn KeyValueStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Task ids currently in the pending index, in registration order.
    pub fn pending_ids(&self) -> Result<Vec<TaskId>, CoreError> {
        match self.store.get(EXPORT_JOBS_KEY)? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|source| CoreError::Corrupt {
                key: EXPORT_JOBS_KEY.to_string(),
                source,
            }),
        }
    }

    /// Read the stored record for `task_id`.
    pub fn record(&self, task_id: &str) -> Result<Option<JobRecord>, CoreError> {
        match self.store.get(task_id)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| CoreError::Corrupt {
                    key: task_id.to_string(),
                    source,
                }),
        }
    }

    /// Register a newly accepted (or reloaded) job.
    ///
    /// Writes a `PROCESSING` record unless one already exists, and appends
    /// the id to the pending index if it is not there yet. Returns the
    /// record now in effect, so a reloaded terminal job keeps its state.
    pub fn register(&self, job: &ExportJob) -> Result<JobRecord, CoreError> {
        validate_task_id(&job.task_id)?;

        let record = match self.record(&job.task_id)? {
            Some(existing) => existing,
            None => {
                let fresh = JobRecord::processing(job.name.clone(), job.output_format.clone());
                self.put(&job.task_id, &fresh)?;
                fresh
            }
        };

        let mut ids = self.pending_ids()?;
        if !ids.iter().any(|id| id == &job.task_id) {
            ids.push(job.task_id.clone());
            self.put_index(&ids)?;
        }

        tracing::debug!(task_id = %job.task_id, state = %record.state, "Registered export job");
        Ok(record)
    }

    /// Persist a new state for `task_id`.
    ///
    /// Rejects writes that would move a stored record backwards.
    pub fn write_record(&self, task_id: &str, record: &JobRecord) -> Result<(), CoreError> {
        validate_task_id(task_id)?;
        if let Some(current) = self.record(task_id)? {
            if !current.state.can_transition_to(record.state) {
                return Err(CoreError::Conflict(format!(
                    "Job {task_id} is already {}; refusing to store {}",
                    current.state, record.state
                )));
            }
        }
        self.put(task_id, record)
    }

    /// Delete the record for `task_id` and drop it from the pending index.
    ///
    /// Unknown ids are a no-op. Returns `true` if anything was removed.
    pub fn forget(&self, task_id: &str) -> Result<bool, CoreError> {
        if RESERVED_KEYS.contains(&task_id) {
            return Ok(false);
        }

        let had_record = self.store.remove(task_id)?;

        let mut ids = self.pending_ids()?;
        let before = ids.len();
        ids.retain(|id| id != task_id);
        let was_indexed = ids.len() != before;
        if was_indexed {
            self.put_index(&ids)?;
        }

        if had_record || was_indexed {
            tracing::debug!(task_id, "Forgot export job");
        }
        Ok(had_record || was_indexed)
    }

    /// All pending jobs together with their stored records.
    ///
    /// Index entries whose record is missing are skipped with a warning.
    pub fn pending_jobs(&self) -> Result<Vec<(ExportJob, JobRecord)>, CoreError> {
        let mut jobs = Vec::new();
        for task_id in self.pending_ids()? {
            match self.record(&task_id)? {
                Some(record) => jobs.push((record.to_export_job(task_id), record)),
                None => {
                    tracing::warn!(task_id = %task_id, "Pending export has no stored record");
                }
            }
        }
        Ok(jobs)
    }

    // ---- private helpers ----

    fn put(&self, task_id: &str, record: &JobRecord) -> Result<(), CoreError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| CoreError::Internal(format!("Failed to encode job record: {e}")))?;
        self.store.set(task_id, &raw)
    }

    fn put_index(&self, ids: &[TaskId]) -> Result<(), CoreError> {
        let raw = serde_json::to_string(ids)
            .map_err(|e| CoreError::Internal(format!("Failed to encode export index: {e}")))?;
        self.store.set(EXPORT_JOBS_KEY, &raw)
    }
}

/// Task ids double as store keys, so they must be non-empty and must not
/// collide with the ledger's own keys.
pub fn validate_task_id(task_id: &str) -> Result<(), CoreError> {
    if task_id.trim().is_empty() {
        return Err(CoreError::Validation("Task id must not be empty".into()));
    }
    if RESERVED_KEYS.contains(&task_id) {
        return Err(CoreError::Validation(format!(
            "Task id '{task_id}' collides with a reserved storage key"
        )));
    }
    Ok(())
}
