//! Status resolution
//!
//! Maps a workflow engine's terminal execution status onto the internal state
//! machine and hands the result to the [`WorkflowEventManager`]. Failures are
//! classified by error type: invalid-input errors become INVALID so rerun
//! tooling never retries them blindly.

use crate::error::{EventError, Result};
use crate::manager::{Announcement, WorkflowEventManager};
use async_trait::async_trait;
use flowstate_core::{EngineStatus, EventType, State};
use flowstate_store::StateRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const TIMED_OUT_ERROR_TYPE: &str = "TimedOutError";
pub const TIMED_OUT_CAUSE: &str = "The workflow execution timed out.";
const UNKNOWN: &str = "unknown";

/// `Error`/`Cause` pair reported with a failed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
    #[serde(rename = "Cause", default)]
    pub cause: Option<String>,
}

impl ExecutionError {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            cause: Some(cause.into()),
        }
    }

    /// Error type, `unknown` when absent
    pub fn error_type(&self) -> &str {
        self.error.as_deref().unwrap_or(UNKNOWN)
    }

    /// `"<type>: <message>"`, preferring `errorMessage` from a JSON cause
    pub fn message(&self) -> String {
        let detail = match self.cause.as_deref() {
            None => UNKNOWN.to_string(),
            Some(cause) => match serde_json::from_str::<Value>(cause) {
                Ok(Value::Object(obj)) => obj
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or(UNKNOWN)
                    .to_string(),
                _ => cause.to_string(),
            },
        };
        format!("{}: {}", self.error_type(), detail)
    }
}

/// Source of an execution's recorded failure, for events that arrive without one
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    async fn last_error(&self, execution: &str) -> Result<Option<ExecutionError>>;
}

/// A workflow engine status-change event
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub execution: String,
    pub payload_id: String,
    /// Raw status string as reported
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub payload_url: Option<String>,
}

#[derive(Deserialize)]
struct RawEvent {
    detail: RawDetail,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDetail {
    execution_arn: String,
    input: Value,
    #[serde(default)]
    output: Option<Value>,
    status: String,
    #[serde(default)]
    error: Option<ExecutionError>,
}

impl StatusChange {
    /// Parse `{"detail": {"executionArn", "input", "output"?, "status", "error"?}}`
    pub fn from_event(event: &Value) -> Result<Self> {
        let raw: RawEvent = serde_json::from_value(event.clone())
            .map_err(|e| EventError::validation(format!("unknown event: {}", e)))?;
        let detail = raw.detail;

        let input = payload_document(detail.input)?
            .ok_or_else(|| EventError::validation("event input is empty"))?;
        let payload_id = input
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::validation("event input has no payload id"))?
            .to_string();

        Ok(Self {
            execution: detail.execution_arn,
            payload_id,
            status: detail.status,
            output: detail.output.map(payload_document).transpose()?.flatten(),
            error: detail.error,
            payload_url: raw.url,
        })
    }

    /// Output item references: each output feature's `self` link
    pub fn output_refs(&self) -> Option<Vec<String>> {
        let features = self.output.as_ref()?.get("features")?.as_array()?;
        let refs: Vec<String> = features
            .iter()
            .filter_map(|feature| feature.get("links")?.as_array())
            .flat_map(|links| links.iter())
            .filter(|link| link.get("rel").and_then(Value::as_str) == Some("self"))
            .filter_map(|link| link.get("href").and_then(Value::as_str).map(str::to_string))
            .collect();
        Some(refs)
    }
}

/// Engine documents arrive either embedded or as JSON strings
fn payload_document(value: Value) -> Result<Option<Value>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(serde_json::from_str(&s)?)),
        other => Ok(Some(other)),
    }
}

/// The internal outcome of a status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: EngineStatus,
    pub state: State,
    pub event_type: EventType,
    pub error: Option<String>,
}

/// Resolves engine statuses and applies them through the manager
#[derive(Clone)]
pub struct StatusResolver {
    invalid_error_types: Vec<String>,
    history: Option<Arc<dyn ExecutionHistory>>,
}

impl StatusResolver {
    pub fn new(invalid_error_types: Vec<String>) -> Self {
        Self {
            invalid_error_types,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn ExecutionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Whether `error_type` names an invalid-input error
    pub fn is_invalid_input(&self, error_type: &str) -> bool {
        self.invalid_error_types.iter().any(|t| t == error_type)
            || error_type.rsplit('.').next() == Some("InvalidInput")
    }

    /// Classify a status change without writing anything
    pub async fn resolve(&self, change: &StatusChange) -> Result<Resolution> {
        let status: EngineStatus = change
            .status
            .parse()
            .map_err(|_| EventError::UnsupportedStatus(change.status.clone()))?;

        let resolution = match status {
            EngineStatus::Succeeded => Resolution {
                status,
                state: State::Completed,
                event_type: EventType::Succeeded,
                error: None,
            },
            EngineStatus::Aborted => Resolution {
                status,
                state: State::Aborted,
                event_type: EventType::Aborted,
                error: None,
            },
            EngineStatus::TimedOut => {
                self.classify(status, &ExecutionError::new(TIMED_OUT_ERROR_TYPE, TIMED_OUT_CAUSE))
            }
            EngineStatus::Failed => {
                let error = match &change.error {
                    Some(error) => error.clone(),
                    None => self.lookup_error(&change.execution).await,
                };
                self.classify(status, &error)
            }
        };

        debug!(
            status = %resolution.status,
            state = %resolution.state,
            event_type = %resolution.event_type,
            "Resolved execution status"
        );
        Ok(resolution)
    }

    fn classify(&self, status: EngineStatus, error: &ExecutionError) -> Resolution {
        let error_type = error.error_type();
        let (state, event_type) = if self.is_invalid_input(error_type) {
            (State::Invalid, EventType::Invalid)
        } else if error_type == TIMED_OUT_ERROR_TYPE {
            (State::Failed, EventType::TimedOut)
        } else {
            (State::Failed, EventType::Failed)
        };

        Resolution {
            status,
            state,
            event_type,
            error: Some(error.message()),
        }
    }

    async fn lookup_error(&self, execution: &str) -> ExecutionError {
        let unknown = ExecutionError {
            error: Some("Unknown".to_string()),
            cause: None,
        };
        let Some(history) = &self.history else {
            return unknown;
        };

        match history.last_error(execution).await {
            Ok(Some(error)) => error,
            Ok(None) => unknown,
            Err(e) => {
                warn!(execution, error = %e, "Unable to read execution history");
                unknown
            }
        }
    }

    /// Resolve a status change and announce it
    #[instrument(skip(self, manager, change), fields(payload_id = %change.payload_id, status = %change.status))]
    pub async fn apply(
        &self,
        manager: &WorkflowEventManager,
        change: &StatusChange,
    ) -> Result<Option<StateRecord>> {
        let resolution = self.resolve(change).await?;
        if let Some(error) = &resolution.error {
            info!(error = %error, "Execution failed");
        }

        let mut announcement = Announcement::for_payload(change.payload_id.as_str())
            .execution(change.execution.as_str())
            .payload_url(change.payload_url.clone());
        announcement.error = resolution.error;
        if resolution.event_type == EventType::Succeeded {
            announcement.outputs = change.output_refs();
        }

        manager.announce(resolution.event_type, announcement).await
    }
}
