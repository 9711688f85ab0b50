//! Locating and reading the error log of a failed batch task
//!
//! A failed task reports an `Error`/`Cause` pair whose cause is a JSON
//! document listing attempts. The last attempt's container names the log
//! stream holding the task's final output line, which carries the real error.

use crate::error::{LogExtractionError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

/// Error type used when a log line carries no `Type:` prefix
pub const DEFAULT_ERROR_TYPE: &str = "UnknownError";

lazy_static! {
    static ref ERROR_LINE_REGEX: Regex =
        Regex::new(r"^(?:([\.\w]+):)?\s*(.*)").expect("error line regex is valid");
}

/// Where a failed task's log lives, plus what the engine said about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLogRef {
    pub log_stream_name: String,
    pub container_reason: Option<String>,
    pub status_reason: Option<String>,
}

impl BatchLogRef {
    /// Diagnosis used when the log itself cannot be read
    pub fn never_ran_message(&self) -> String {
        format!(
            "Unable to get error log, container likely never ran. Container Reason: {}; Status Reason: {}",
            self.container_reason.as_deref().unwrap_or("None"),
            self.status_reason.as_deref().unwrap_or("None"),
        )
    }
}

/// Find the log stream of the last attempt in a task's `Error`/`Cause` object.
///
/// Each missing piece has its own error so "never started" can be told apart
/// from "started but left no usable log".
pub fn extract_log_ref(error: &Value) -> std::result::Result<BatchLogRef, LogExtractionError> {
    let cause = match error.get("Cause") {
        None | Some(Value::Null) => return Err(LogExtractionError::MissingCause),
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .map_err(|e| LogExtractionError::MalformedCause(e.to_string()))?,
        Some(other) => other.clone(),
    };

    let attempt = cause
        .get("Attempts")
        .and_then(Value::as_array)
        .and_then(|attempts| attempts.last())
        .ok_or(LogExtractionError::EmptyAttempts)?;

    let container = match attempt.get("Container") {
        None | Some(Value::Null) => return Err(LogExtractionError::MissingContainer),
        Some(container) => container,
    };

    let log_stream_name = container
        .get("LogStreamName")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or(LogExtractionError::MissingLogStreamName)?;

    Ok(BatchLogRef {
        log_stream_name: log_stream_name.to_string(),
        container_reason: container
            .get("Reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        status_reason: attempt
            .get("StatusReason")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Split a task's final log line into `(error_type, message)`
pub fn parse_error_line(line: &str) -> (String, String) {
    match ERROR_LINE_REGEX.captures(line) {
        Some(caps) => (
            caps.get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| DEFAULT_ERROR_TYPE.to_string()),
            caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        ),
        None => (DEFAULT_ERROR_TYPE.to_string(), line.to_string()),
    }
}

/// Read access to task log streams
#[async_trait]
pub trait TaskLogSource: Send + Sync {
    /// Last line written to `log_stream_name`, if any
    async fn last_line(&self, log_stream_name: &str) -> Result<Option<String>>;
}

/// Error recovered for a failed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub error_type: String,
    pub message: String,
}

/// Recover the real error of a failed task from its log.
///
/// Falls back to the never-ran diagnosis when the log cannot be read.
pub async fn diagnose(error: &Value, logs: &dyn TaskLogSource) -> Result<TaskFailure> {
    let log_ref = extract_log_ref(error)?;
    info!(log_stream = %log_ref.log_stream_name, "Reading task error log");

    match logs.last_line(&log_ref.log_stream_name).await {
        Ok(Some(line)) => {
            let (error_type, message) = parse_error_line(&line);
            Ok(TaskFailure {
                error_type,
                message,
            })
        }
        Ok(None) => Ok(never_ran(&log_ref)),
        Err(e) => {
            warn!(log_stream = %log_ref.log_stream_name, error = %e, "Unable to read task error log");
            Ok(never_ran(&log_ref))
        }
    }
}

fn never_ran(log_ref: &BatchLogRef) -> TaskFailure {
    TaskFailure {
        error_type: DEFAULT_ERROR_TYPE.to_string(),
        message: log_ref.never_ran_message(),
    }
}
