//! User-facing notices.
//!
//! Failures that the dashboard used to show as toasts are published as
//! [`Notice`]s so that any front end (the CLI, a log sink) can surface them.

use serde::Serialize;

/// Shown when a status poll fails for any reason.
pub const MSG_STATUS_CHECK_FAILED: &str = "error checking job status";
/// Shown when fetching a finished export fails.
pub const MSG_DOWNLOAD_EXPIRED: &str = "download has expired.";
/// Status line of a job the service reported as failed.
pub const MSG_TASK_FAILED: &str = "Task failed during processing";
/// Follow-up explaining that failed jobs are not billed.
pub const MSG_USAGE_NOT_RECORDED: &str = "api usage has not been recorded.";
/// Status line before the first poll answers.
pub const MSG_PROCESSING: &str = "Processing...";
/// Shown when polling gives up after repeated errors.
pub const MSG_POLLING_ABANDONED: &str =
    "stopped checking job status after repeated errors; resume to try again";

/// Severity of a [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A transient message meant for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}
