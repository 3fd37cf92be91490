//! Submit-and-wait helper for transforms whose result is used in place.
//!
//! Unlike the [`crate::tracker`], nothing here is persisted: the job is
//! polled on a short interval until it finishes or the deadline passes.

use std::time::Duration;

use geoflip_core::types::TaskId;

use crate::api::{ApiError, StatusOutcome};
use crate::request::TransformRequest;
use crate::service::TransformService;

/// Timing for [`await_output`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    pub poll_interval: Duration,
    /// Overall deadline, measured from submission.
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Geoflip job {task_id} failed: {message}")]
    Failed { task_id: TaskId, message: String },

    /// The deadline passed. `task_id` is `None` if the submission itself
    /// never returned.
    #[error("Timed out waiting for Geoflip job after {after:?}")]
    TimedOut {
        task_id: Option<TaskId>,
        after: Duration,
    },

    #[error("Job output is not valid GeoJSON: {0}")]
    InvalidOutput(#[source] serde_json::Error),
}

/// A finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub task_id: TaskId,
    pub output_url: String,
}

/// Submit `request` and poll until the job yields an output link.
pub async fn await_output(
    service: &dyn TransformService,
    request: &TransformRequest,
    config: &CompletionConfig,
) -> Result<Completed, CompletionError> {
    let deadline = tokio::time::Instant::now() + config.timeout;

    let task_id = match tokio::time::timeout_at(deadline, service.submit(request)).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::warn!("Transform submission did not return in time");
            return Err(CompletionError::TimedOut {
                task_id: None,
                after: config.timeout,
            });
        }
    };
    tracing::debug!(task_id = %task_id, "Waiting for transform to complete");

    match tokio::time::timeout_at(deadline, poll_until_done(service, &task_id, config)).await {
        Ok(result) => result.map(|output_url| Completed {
            task_id,
            output_url,
        }),
        Err(_) => {
            tracing::warn!(task_id = %task_id, "Transform did not complete in time");
            Err(CompletionError::TimedOut {
                task_id: Some(task_id),
                after: config.timeout,
            })
        }
    }
}

/// Like [`await_output`], then download the result and parse it as GeoJSON.
pub async fn await_geojson(
    service: &dyn TransformService,
    request: &TransformRequest,
    config: &CompletionConfig,
) -> Result<serde_json::Value, CompletionError> {
    let completed = await_output(service, request, config).await?;
    let bytes = service.fetch_output(&completed.output_url).await?;
    serde_json::from_slice(&bytes).map_err(CompletionError::InvalidOutput)
}

async fn poll_until_done(
    service: &dyn TransformService,
    task_id: &str,
    config: &CompletionConfig,
) -> Result<String, CompletionError> {
    loop {
        tokio::time::sleep(config.poll_interval).await;

        let status = service.status(task_id).await?;
        match status.outcome()? {
            StatusOutcome::Processing => continue,
            StatusOutcome::Success { output_url } => return Ok(output_url.to_string()),
            StatusOutcome::Failure => {
                return Err(CompletionError::Failed {
                    task_id: task_id.to_string(),
                    message: status.message.clone().unwrap_or_default(),
                })
            }
        }
    }
}
