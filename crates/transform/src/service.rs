//! The seam between the tracker and the remote transformation service.

use async_trait::async_trait;
use geoflip_core::types::TaskId;

use crate::api::{ApiError, GeoflipApi, JobStatus};
use crate::request::TransformRequest;

/// Remote operations the export tracker depends on.
///
/// [`GeoflipApi`] is the production implementation; tests substitute a
/// scripted service.
#[async_trait]
pub trait TransformService: Send + Sync {
    /// Queue a transformation and return the issued task id.
    async fn submit(&self, request: &TransformRequest) -> Result<TaskId, ApiError>;

    /// Current status of a queued job.
    async fn status(&self, task_id: &str) -> Result<JobStatus, ApiError>;

    /// Download a finished artifact.
    async fn fetch_output(&self, output_url: &str) -> Result<Vec<u8>, ApiError>;
}

#[async_trait]
impl TransformService for GeoflipApi {
    async fn submit(&self, request: &TransformRequest) -> Result<TaskId, ApiError> {
        GeoflipApi::submit(self, request).await
    }

    async fn status(&self, task_id: &str) -> Result<JobStatus, ApiError> {
        self.job_status(task_id).await
    }

    async fn fetch_output(&self, output_url: &str) -> Result<Vec<u8>, ApiError> {
        GeoflipApi::fetch_output(self, output_url).await
    }
}
