//! Workflow event messages and their notification attributes

use crate::error::{EventError, Result};
use chrono::{DateTime, Utc};
use flowstate_core::{format_timestamp, parse_utc_timestamp, EventType, PAYLOAD_ID_REGEX};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Message body keys owned by the event itself
pub const RESERVED_FIELDS: [&str; 6] = [
    "event_type",
    "payload_id",
    "timestamp",
    "payload_url",
    "execution",
    "error",
];

/// Most attributes a subscriber filter can see per message
pub const MAX_ATTRIBUTES: usize = 10;

/// One announced workflow event
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvent {
    pub event_type: EventType,
    pub payload_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload_url: Option<String>,
    pub execution: Option<String>,
    pub error: Option<String>,
    pub extra_fields: Map<String, Value>,
}

/// Serialized body plus filterable attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, payload_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            payload_id: payload_id.into(),
            timestamp,
            payload_url: None,
            execution: None,
            error: None,
            extra_fields: Map::new(),
        }
    }

    pub fn with_payload_url(mut self, payload_url: Option<String>) -> Self {
        self.payload_url = payload_url;
        self
    }

    pub fn with_execution(mut self, execution: Option<String>) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    /// Attach caller-supplied body fields; reserved keys are rejected
    pub fn with_extra_fields(mut self, extra_fields: Map<String, Value>) -> Result<Self> {
        check_extra_fields(&extra_fields)?;
        self.extra_fields = extra_fields;
        Ok(self)
    }

    /// JSON body: the event's own fields, empty ones omitted, then extra fields
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("event_type".into(), Value::String(self.event_type.to_string()));
        body.insert("payload_id".into(), Value::String(self.payload_id.clone()));
        body.insert("timestamp".into(), Value::String(format_timestamp(self.timestamp)));

        let optional = [
            ("payload_url", &self.payload_url),
            ("execution", &self.execution),
            ("error", &self.error),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                body.insert(name.into(), Value::String(value.clone()));
            }
        }

        for (name, value) in &self.extra_fields {
            body.insert(name.clone(), value.clone());
        }
        Value::Object(body)
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.body())?)
    }

    /// Parse a body produced by [`WorkflowEvent::serialize`]
    pub fn from_message_str(message: &str) -> Result<Self> {
        let mut body: Map<String, Value> = serde_json::from_str(message)?;

        let mut take = |name: &str| -> Option<String> {
            match body.remove(name) {
                Some(Value::String(s)) => Some(s),
                _ => None,
            }
        };

        let event_type = take("event_type")
            .ok_or_else(|| EventError::validation("message has no event_type"))?
            .parse::<EventType>()?;
        let payload_id =
            take("payload_id").ok_or_else(|| EventError::validation("message has no payload_id"))?;
        let timestamp = take("timestamp")
            .ok_or_else(|| EventError::validation("message has no timestamp"))?;
        let payload_url = take("payload_url");
        let execution = take("execution");
        let error = take("error");

        Ok(Self {
            event_type,
            payload_id,
            timestamp: parse_utc_timestamp(&timestamp)?,
            payload_url,
            execution,
            error,
            extra_fields: body,
        })
    }

    /// Attributes subscribers can filter on without parsing the body
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("event_type".to_string(), self.event_type.to_string());

        if let Some(caps) = PAYLOAD_ID_REGEX.captures(&self.payload_id) {
            attrs.insert("workflow".to_string(), caps["workflow"].to_string());
            attrs.insert("collections".to_string(), caps["collections"].to_string());
        }
        if let Some(error) = &self.error {
            attrs.insert("error".to_string(), error.clone());
        }

        debug_assert!(attrs.len() <= MAX_ATTRIBUTES);
        attrs
    }

    pub fn to_message(&self) -> Result<NotificationMessage> {
        Ok(NotificationMessage {
            body: self.serialize()?,
            attributes: self.attributes(),
        })
    }
}

/// Reject extra fields that would overwrite the event's own keys
pub fn check_extra_fields(extra_fields: &Map<String, Value>) -> Result<()> {
    let collisions: Vec<&str> = RESERVED_FIELDS
        .iter()
        .copied()
        .filter(|name| extra_fields.contains_key(*name))
        .collect();

    if collisions.is_empty() {
        Ok(())
    } else {
        Err(EventError::validation(format!(
            "extra fields must not re-specify reserved keys: {}",
            collisions.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_body_omits_empty_fields() {
        let event = WorkflowEvent::new(EventType::Succeeded, "c/workflow-w/i", at())
            .with_error(Some(String::new()));
        let body = event.body();

        assert_eq!(body["event_type"], "SUCCEEDED");
        assert_eq!(body["payload_id"], "c/workflow-w/i");
        assert_eq!(body["timestamp"], "2024-05-01T12:00:00.000000Z");
        assert!(body.get("error").is_none());
        assert!(body.get("execution").is_none());
    }

    #[test]
    fn test_attributes_from_payload_id() {
        let event = WorkflowEvent::new(EventType::Failed, "sar-c/workflow-rtc/a/b", at())
            .with_error(Some("Boom: x".to_string()));
        let attrs = event.attributes();

        assert_eq!(attrs["event_type"], "FAILED");
        assert_eq!(attrs["workflow"], "rtc");
        assert_eq!(attrs["collections"], "sar-c");
        assert_eq!(attrs["error"], "Boom: x");

        let event = WorkflowEvent::new(EventType::NotAProcessPayload, "garbage", at());
        let attrs = event.attributes();
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_reserved_extra_fields_are_rejected() {
        let mut extra = Map::new();
        extra.insert("payload_id".to_string(), json!("other"));
        let err = WorkflowEvent::new(EventType::Aborted, "c/workflow-w/i", at())
            .with_extra_fields(extra)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_message_body_parses_back() {
        let mut extra = Map::new();
        extra.insert("attempt".to_string(), json!(2));
        let event = WorkflowEvent::new(EventType::StartedProcessing, "c/workflow-w/i", at())
            .with_execution(Some("exec-1".to_string()))
            .with_payload_url(Some("s3://bucket/payload.json".to_string()))
            .with_extra_fields(extra)
            .unwrap();

        let message = event.to_message().unwrap();
        let parsed = WorkflowEvent::from_message_str(&message.body).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_message_without_event_type_is_invalid() {
        let err = WorkflowEvent::from_message_str(r#"{"payload_id": "x"}"#).unwrap_err();
        assert!(err.is_validation());
    }
}
