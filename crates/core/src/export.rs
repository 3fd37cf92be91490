//! Export job lifecycle: output formats, job states, and durable job records.
//!
//! A job record is created in [`JobState::Processing`] when the remote API
//! accepts a submission and only ever moves forward to one of the two
//! terminal states. Records are serialized with the exact field names the
//! durable ledger has always used (`state`, `output_url`, `name`,
//! `outputFormat`).

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{TaskId, Timestamp};

// ---------------------------------------------------------------------------
// Output format constants
// ---------------------------------------------------------------------------

/// ESRI shapefile, delivered as a zip archive.
pub const FORMAT_SHAPEFILE: &str = "shp";
/// OGC GeoPackage.
pub const FORMAT_GEOPACKAGE: &str = "gpkg";
/// AutoCAD drawing exchange format.
pub const FORMAT_DXF: &str = "dxf";
/// Comma-separated values with WKT geometry.
pub const FORMAT_CSV: &str = "csv";
/// GeoJSON feature collection.
pub const FORMAT_GEOJSON: &str = "geojson";

/// All output formats the transformation service can produce.
pub const VALID_OUTPUT_FORMATS: &[&str] = &[
    FORMAT_SHAPEFILE,
    FORMAT_GEOPACKAGE,
    FORMAT_DXF,
    FORMAT_CSV,
    FORMAT_GEOJSON,
];

/// Prefix applied to every downloaded export file.
pub const DOWNLOAD_FILE_PREFIX: &str = "geoflip";

/// Validate that an output format is one the service accepts.
pub fn validate_output_format(format: &str) -> Result<(), CoreError> {
    if VALID_OUTPUT_FORMATS.contains(&format) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "Unknown output format: '{format}'. Valid formats: {}",
            VALID_OUTPUT_FORMATS.join(", ")
        )))
    }
}

/// Map an output format to the extension of the downloaded file.
///
/// Shapefiles arrive zipped; every other format keeps its own name.
pub fn file_extension(format: &str) -> &str {
    match format {
        FORMAT_SHAPEFILE => "zip",
        FORMAT_GEOPACKAGE => "gpkg",
        FORMAT_DXF => "dxf",
        other => other,
    }
}

/// Build the file name an export is saved under, e.g. `geoflip_roads.zip`.
pub fn download_file_name(name: &str, format: &str) -> String {
    format!("{DOWNLOAD_FILE_PREFIX}_{name}.{}", file_extension(format))
}

/// Label given to jobs submitted from the pipeline planner, e.g.
/// `pipeline_shp_2024-05-01T10-20-30-123Z`.
pub fn pipeline_job_name(input_format: &str, at: Timestamp) -> String {
    let stamp = at
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("pipeline_{input_format}_{stamp}")
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Client-side view of a remote job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Processing,
    Success,
    Failure,
}

impl JobState {
    /// `SUCCESS` and `FAILURE` end polling for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Whether moving from `self` to `next` respects forward-only ordering.
    ///
    /// Re-asserting the current state is allowed so that repeated writes of
    /// the same poll result stay idempotent.
    pub fn can_transition_to(self, next: JobState) -> bool {
        self == next || (self == Self::Processing && next.is_terminal())
    }

    /// Wire name as stored in the ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Entry in the in-memory export list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub task_id: TaskId,
    pub name: String,
    pub output_format: String,
}

impl ExportJob {
    pub fn new(
        task_id: impl Into<TaskId>,
        name: impl Into<String>,
        output_format: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            output_format: output_format.into(),
        }
    }

    /// Name of the file this export is saved under once downloaded.
    pub fn download_file_name(&self) -> String {
        download_file_name(&self.name, &self.output_format)
    }
}

/// Durable per-job record, stored as JSON under the job's task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub state: JobState,
    pub output_url: Option<String>,
    pub name: String,
    #[serde(rename = "outputFormat")]
    pub output_format: String,
}

impl JobRecord {
    /// Fresh record for a job the remote API has just accepted.
    pub fn processing(name: impl Into<String>, output_format: impl Into<String>) -> Self {
        Self {
            state: JobState::Processing,
            output_url: None,
            name: name.into(),
            output_format: output_format.into(),
        }
    }

    /// Move to `SUCCESS` with the download link.
    pub fn succeed(self, output_url: impl Into<String>) -> Result<Self, CoreError> {
        self.check_transition(JobState::Success)?;
        Ok(Self {
            state: JobState::Success,
            output_url: Some(output_url.into()),
            ..self
        })
    }

    /// Move to `FAILURE`. Any previous link is dropped.
    pub fn fail(self) -> Result<Self, CoreError> {
        self.check_transition(JobState::Failure)?;
        Ok(Self {
            state: JobState::Failure,
            output_url: None,
            ..self
        })
    }

    /// The download link, available only once the job has succeeded.
    pub fn download_url(&self) -> Option<&str> {
        match self.state {
            JobState::Success => self.output_url.as_deref(),
            _ => None,
        }
    }

    /// Rebuild the in-memory list entry for this record.
    pub fn to_export_job(&self, task_id: impl Into<TaskId>) -> ExportJob {
        ExportJob::new(task_id, self.name.clone(), self.output_format.clone())
    }

    fn check_transition(&self, next: JobState) -> Result<(), CoreError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!(
                "Job state cannot move from {} to {next}",
                self.state
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn shapefile_downloads_as_zip() {
        assert_eq!(file_extension("shp"), "zip");
    }

    #[test]
    fn known_formats_keep_their_extension() {
        assert_eq!(file_extension("gpkg"), "gpkg");
        assert_eq!(file_extension("dxf"), "dxf");
    }

    #[test]
    fn unknown_formats_pass_through() {
        assert_eq!(file_extension("csv"), "csv");
        assert_eq!(file_extension("geojson"), "geojson");
        assert_eq!(file_extension("kml"), "kml");
    }

    #[test]
    fn download_name_uses_prefix_and_extension() {
        assert_eq!(download_file_name("test1", "gpkg"), "geoflip_test1.gpkg");
        assert_eq!(download_file_name("roads", "shp"), "geoflip_roads.zip");
    }

    #[test]
    fn output_format_validation() {
        assert!(validate_output_format("gpkg").is_ok());
        assert_matches!(
            validate_output_format("kml"),
            Err(CoreError::Validation(msg)) if msg.contains("kml")
        );
    }

    #[test]
    fn pipeline_name_replaces_separators() {
        let at = chrono::Utc
            .with_ymd_and_hms(2024, 5, 1, 10, 20, 30)
            .single()
            .expect("valid timestamp");
        assert_eq!(
            pipeline_job_name("shp", at),
            "pipeline_shp_2024-05-01T10-20-30-000Z"
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failure.is_terminal());
    }

    #[test]
    fn transitions_are_forward_only() {
        assert!(JobState::Processing.can_transition_to(JobState::Success));
        assert!(JobState::Processing.can_transition_to(JobState::Failure));
        assert!(JobState::Success.can_transition_to(JobState::Success));
        assert!(!JobState::Success.can_transition_to(JobState::Processing));
        assert!(!JobState::Failure.can_transition_to(JobState::Success));
        assert!(!JobState::Success.can_transition_to(JobState::Failure));
    }

    #[test]
    fn record_serializes_with_ledger_field_names() {
        let record = JobRecord::processing("test1", "gpkg")
            .succeed("https://api.example/out.gpkg")
            .unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "state": "SUCCESS",
                "output_url": "https://api.example/out.gpkg",
                "name": "test1",
                "outputFormat": "gpkg",
            })
        );
    }

    #[test]
    fn processing_record_has_null_url() {
        let json = serde_json::to_value(JobRecord::processing("a", "dxf")).unwrap();
        assert_eq!(json["state"], "PROCESSING");
        assert!(json["output_url"].is_null());
    }

    #[test]
    fn failed_record_cannot_succeed() {
        let failed = JobRecord::processing("a", "dxf").fail().unwrap();
        assert_matches!(failed.succeed("https://x"), Err(CoreError::Conflict(_)));
    }

    #[test]
    fn download_url_only_after_success() {
        let record = JobRecord::processing("a", "dxf");
        assert!(record.download_url().is_none());
        let record = record.succeed("https://x/out.dxf").unwrap();
        assert_eq!(record.download_url(), Some("https://x/out.dxf"));
    }
}
