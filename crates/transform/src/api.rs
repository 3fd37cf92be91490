//! REST client for the Geoflip HTTP endpoints.
//!
//! Wraps job submission, status polling, output retrieval, and the
//! synchronous GeoJSON export using [`reqwest`].

use geoflip_core::types::TaskId;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::request::{Endpoint, TransformRequest};

/// HTTP client for one Geoflip deployment.
#[derive(Clone)]
pub struct GeoflipApi {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

/// Response returned by the submission endpoints after queuing a job.
///
/// The versioned endpoints answer with `task_id`, the legacy one with
/// `job_id`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl SubmitResponse {
    /// The issued identifier, whichever field carried it.
    pub fn into_task_id(self) -> Result<TaskId, ApiError> {
        self.task_id
            .or(self.job_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("no task_id or job_id in response".into()))
    }
}

/// Body of `GET /result/status/{task_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: String,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Interpretation of a [`JobStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome<'a> {
    Processing,
    Success { output_url: &'a str },
    Failure,
}

impl JobStatus {
    pub fn processing(message: Option<&str>) -> Self {
        Self {
            status: "PROCESSING".into(),
            output_url: None,
            message: message.map(str::to_string),
        }
    }

    pub fn success(output_url: impl Into<String>) -> Self {
        Self {
            status: "SUCCESS".into(),
            output_url: Some(output_url.into()),
            message: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            status: "FAILURE".into(),
            output_url: None,
            message: None,
        }
    }

    /// Classify the remote status.
    ///
    /// Any status other than success or failure (`PENDING`, `STARTED`,
    /// `RETRY`, ...) means the job is still running. A success without an
    /// output link is reported as an invalid response.
    pub fn outcome(&self) -> Result<StatusOutcome<'_>, ApiError> {
        match self.status.to_ascii_uppercase().as_str() {
            "SUCCESS" => match self.output_url.as_deref() {
                Some(url) if !url.is_empty() => Ok(StatusOutcome::Success { output_url: url }),
                _ => Err(ApiError::InvalidResponse(
                    "job reported SUCCESS without an output_url".into(),
                )),
            },
            "FAILURE" | "FAILED" | "REVOKED" => Ok(StatusOutcome::Failure),
            _ => Ok(StatusOutcome::Processing),
        }
    }
}

/// Errors from the Geoflip REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No usable answer from the server.
    #[error("Request to Geoflip failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server rejected the session token (HTTP 401).
    #[error("Session expired or invalid")]
    Unauthorized,

    /// The account hit its request allowance (HTTP 429).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Any other non-2xx status code.
    #[error("Geoflip API error ({status}): {body}")]
    Status {
        status: u16,
        /// Response body, kept for error detail extraction.
        body: String,
    },

    /// A 2xx response whose body did not have the expected shape.
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// HTTP status code, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::RateLimited(_) => Some(429),
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::InvalidResponse(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unauthorized => "Your session has expired. Please login again.".to_string(),
            Self::RateLimited(message) => format!("Free tier limit reached: {message}"),
            Self::Status { body, .. } => extract_error_detail(body)
                .map(|detail| format!("error from geoflip - {detail}"))
                .unwrap_or_else(|| "An unexpected error occurred. Please try again.".to_string()),
            Self::Request(e) => format!("An unexpected error occurred - {e}"),
            Self::InvalidResponse(_) => {
                "An unexpected error occurred. Please try again.".to_string()
            }
        }
    }
}

/// Pull `errors.json` out of a validation error body, re-encoded as JSON.
fn extract_error_detail(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let detail = parsed.get("errors")?.get("json")?;
    serde_json::to_string(detail).ok()
}

impl GeoflipApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `https://api.geoflip.io`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Attach (or clear) the bearer token sent with submissions.
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Upload a file and queue an asynchronous transformation.
    ///
    /// Sends a multipart form with `file` and `config` parts and returns the
    /// task id from the 200/202 acceptance.
    pub async fn submit(&self, request: &TransformRequest) -> Result<TaskId, ApiError> {
        let url = match &request.endpoint {
            Endpoint::Versioned { input_format } => {
                format!("{}/v1/transform/{input_format}?async=true", self.api_url)
            }
            Endpoint::Legacy => format!("{}/transform", self.api_url),
        };

        let config = serde_json::to_string(&request.config)
            .map_err(|e| ApiError::InvalidResponse(format!("failed to encode config: {e}")))?;
        let file = reqwest::multipart::Part::bytes(request.file.clone())
            .file_name(request.file_name.clone());
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("config", config);

        let response = self
            .authorized(self.client.post(url))
            .multipart(form)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        submitted.into_task_id()
    }

    /// Query the status of a queued job.
    ///
    /// Sends a `GET /result/status/{task_id}` request.
    pub async fn job_status(&self, task_id: &str) -> Result<JobStatus, ApiError> {
        let response = self
            .client
            .get(format!("{}/result/status/{task_id}", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch a finished artifact from its (time-limited) download link.
    pub async fn fetch_output(&self, output_url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self.client.get(output_url).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Convert a GeoJSON feature collection synchronously.
    ///
    /// Sends `POST /v1/transform/geojson` with a JSON body and returns the
    /// converted file bytes directly; no job is created.
    pub async fn export_geojson(&self, export: &GeoJsonExport) -> Result<Vec<u8>, ApiError> {
        let response = self
            .authorized(
                self.client
                    .post(format!("{}/v1/transform/geojson", self.api_url)),
            )
            .json(export)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Ensure the response has a success status code. Returns the response
    /// unchanged on success, or the matching [`ApiError`] on failure.
    pub(crate) async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());

        Err(match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::TOO_MANY_REQUESTS => {
                let message = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .unwrap_or(body);
                ApiError::RateLimited(message)
            }
            other => ApiError::Status {
                status: other.as_u16(),
                body,
            },
        })
    }

    /// Check the status, then decode the JSON body as `T`.
    pub(crate) async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// Body of the synchronous GeoJSON export.
#[derive(Debug, Clone, Serialize)]
pub struct GeoJsonExport {
    pub input_geojson: serde_json::Value,
    pub output_format: String,
    pub output_crs: String,
}
