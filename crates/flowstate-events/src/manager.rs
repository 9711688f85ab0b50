//! Workflow event manager
//!
//! The single writer of state records and event records. Every announced
//! event flows through three sinks in order:
//!
//! 1. the state store: the authoritative record, any failure fails the call
//! 2. the event log: best-effort, failures are logged and swallowed
//! 3. the notification publisher: best-effort, failures are logged and swallowed

use crate::error::{EventError, Result};
use crate::publisher::Publisher;
use crate::workflow_event::{check_extra_fields, WorkflowEvent};
use chrono::{DateTime, Utc};
use flowstate_core::{decode, format_timestamp, EventType, State, StateKey};
use flowstate_store::metrics;
use flowstate_store::{DisabledEventLog, EventLog, StateRecord, StateStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Everything an event may carry besides its type
#[derive(Debug, Clone, Default)]
pub struct Announcement {
    pub payload_id: Option<String>,
    pub execution: Option<String>,
    pub error: Option<String>,
    /// Output item references recorded on completion
    pub outputs: Option<Vec<String>>,
    pub payload_url: Option<String>,
    /// Transition time; defaults to now
    pub timestamp: Option<DateTime<Utc>>,
    pub extra_fields: Map<String, Value>,
}

impl Announcement {
    pub fn for_payload(payload_id: impl Into<String>) -> Self {
        Self {
            payload_id: Some(payload_id.into()),
            ..Default::default()
        }
    }

    pub fn execution(mut self, execution: impl Into<String>) -> Self {
        self.execution = Some(execution.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn payload_url(mut self, payload_url: Option<String>) -> Self {
        self.payload_url = payload_url;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn extra_fields(mut self, extra_fields: Map<String, Value>) -> Self {
        self.extra_fields = extra_fields;
        self
    }
}

/// Fans workflow events out to the state store, event log and publisher
#[derive(Clone)]
pub struct WorkflowEventManager {
    state_store: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl WorkflowEventManager {
    pub fn new(
        state_store: Arc<dyn StateStore>,
        event_log: Arc<dyn EventLog>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Self {
        Self {
            state_store,
            event_log,
            publisher,
        }
    }

    /// Manager with no event log and no publisher
    pub fn state_only(state_store: Arc<dyn StateStore>) -> Self {
        Self::new(state_store, Arc::new(DisabledEventLog), None)
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state_store
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    /// Apply one workflow event.
    ///
    /// Returns the updated state record for event types that change state.
    #[instrument(skip(self, announcement), fields(payload_id))]
    pub async fn announce(
        &self,
        event_type: EventType,
        announcement: Announcement,
    ) -> Result<Option<StateRecord>> {
        let payload_id = announcement
            .payload_id
            .as_deref()
            .ok_or_else(|| EventError::validation("payload_id is required"))?;
        tracing::Span::current().record("payload_id", payload_id);
        check_extra_fields(&announcement.extra_fields)?;

        let at = announcement.timestamp.unwrap_or_else(Utc::now);
        let key = decode(payload_id)?;

        let record = self.update_state(event_type, &key, &announcement, at).await?;

        if let (Some(state), Some(execution)) =
            (event_type.target_state(), announcement.execution.as_deref())
        {
            self.record_event(&key, state, at, execution).await;
        }

        let event = WorkflowEvent::new(event_type, payload_id, at)
            .with_payload_url(announcement.payload_url)
            .with_execution(announcement.execution)
            .with_error(announcement.error)
            .with_extra_fields(announcement.extra_fields)?;
        self.publish(&event).await;

        Ok(record)
    }

    /// Authoritative write; errors propagate
    async fn update_state(
        &self,
        event_type: EventType,
        key: &StateKey,
        announcement: &Announcement,
        at: DateTime<Utc>,
    ) -> Result<Option<StateRecord>> {
        let store = &self.state_store;
        let error = announcement.error.as_deref().unwrap_or("");
        let execution = || {
            announcement.execution.as_deref().ok_or_else(|| {
                EventError::validation(format!("{} requires an execution reference", event_type))
            })
        };

        let record = match event_type {
            EventType::ClaimedProcessing => store.claim(key, execution()?, at).await,
            EventType::StartedProcessing => store.start(key, execution()?, at).await,
            EventType::Succeeded => store.complete(key, announcement.outputs.as_deref(), at).await,
            EventType::Failed | EventType::TimedOut => store.fail(key, error, at).await,
            EventType::Invalid => store.invalidate(key, error, at).await,
            EventType::Aborted => store.abort(key, at).await,
            _ => return Ok(None),
        };

        match record {
            Ok(record) => {
                info!(state = %record.state, event_type = %event_type, "State updated");
                Ok(Some(record))
            }
            Err(e) if e.is_already_claimed() => {
                info!(event_type = %event_type, "Payload already claimed");
                Err(e.into())
            }
            Err(e) => {
                error!(event_type = %event_type, error = %e, "Unable to update state");
                Err(e.into())
            }
        }
    }

    /// Best-effort analytics write
    async fn record_event(&self, key: &StateKey, state: State, at: DateTime<Utc>, execution: &str) {
        match self
            .event_log
            .record_transition(key, state.into(), &format_timestamp(at), execution)
            .await
        {
            Ok(true) => debug!(state = %state, "Event recorded"),
            Ok(false) => debug!(state = %state, "Event not recorded"),
            Err(e) => warn!(state = %state, error = %e, "Failed to record event, continuing"),
        }
    }

    /// Best-effort notification
    async fn publish(&self, event: &WorkflowEvent) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let result = match event.to_message() {
            Ok(message) => publisher.publish(&message).await,
            Err(e) => Err(e),
        };

        let event_type = event.event_type.as_str();
        match result {
            Ok(()) => {
                metrics::record_notification(event_type, true);
                debug!(event_type, "Notification published");
            }
            Err(e) => {
                metrics::record_notification(event_type, false);
                warn!(event_type, error = %e, "Failed to publish notification, continuing");
            }
        }
    }

    pub async fn claim_processing(
        &self,
        payload_id: &str,
        execution: &str,
        payload_url: Option<String>,
    ) -> Result<StateRecord> {
        let announcement = Announcement::for_payload(payload_id)
            .execution(execution)
            .payload_url(payload_url);
        self.expect_record(EventType::ClaimedProcessing, announcement)
            .await
    }

    pub async fn started_processing(
        &self,
        payload_id: &str,
        execution: &str,
        payload_url: Option<String>,
    ) -> Result<StateRecord> {
        let announcement = Announcement::for_payload(payload_id)
            .execution(execution)
            .payload_url(payload_url);
        self.expect_record(EventType::StartedProcessing, announcement)
            .await
    }

    pub async fn succeeded(
        &self,
        payload_id: &str,
        execution: &str,
        outputs: Option<Vec<String>>,
        payload_url: Option<String>,
    ) -> Result<StateRecord> {
        let mut announcement = Announcement::for_payload(payload_id)
            .execution(execution)
            .payload_url(payload_url);
        announcement.outputs = outputs;
        self.expect_record(EventType::Succeeded, announcement).await
    }

    pub async fn failed(
        &self,
        payload_id: &str,
        message: &str,
        execution: Option<&str>,
    ) -> Result<StateRecord> {
        let announcement = with_execution(Announcement::for_payload(payload_id).error(message), execution);
        self.expect_record(EventType::Failed, announcement).await
    }

    pub async fn timed_out(
        &self,
        payload_id: &str,
        message: &str,
        execution: Option<&str>,
    ) -> Result<StateRecord> {
        let announcement = with_execution(Announcement::for_payload(payload_id).error(message), execution);
        self.expect_record(EventType::TimedOut, announcement).await
    }

    pub async fn invalid(
        &self,
        payload_id: &str,
        error: &str,
        execution: Option<&str>,
    ) -> Result<StateRecord> {
        let announcement = with_execution(Announcement::for_payload(payload_id).error(error), execution);
        self.expect_record(EventType::Invalid, announcement).await
    }

    pub async fn aborted(&self, payload_id: &str, execution: Option<&str>) -> Result<StateRecord> {
        let announcement = with_execution(Announcement::for_payload(payload_id), execution);
        self.expect_record(EventType::Aborted, announcement).await
    }

    /// Announce that a payload was skipped because it is already in `state`
    pub async fn skipping(
        &self,
        payload_id: &str,
        state: State,
        payload_url: Option<String>,
    ) -> Result<()> {
        let event_type = EventType::already(state).ok_or_else(|| {
            EventError::validation(format!("no skip event for payload in state {}", state))
        })?;
        info!(payload_id, state = %state, "Skipping payload");
        self.announce(
            event_type,
            Announcement::for_payload(payload_id).payload_url(payload_url),
        )
        .await?;
        Ok(())
    }

    pub async fn duplicated(&self, payload_id: &str, payload_url: Option<String>) -> Result<()> {
        warn!(payload_id, "Duplicate payload id dropped");
        self.announce(
            EventType::DuplicateIdEncountered,
            Announcement::for_payload(payload_id).payload_url(payload_url),
        )
        .await?;
        Ok(())
    }

    async fn expect_record(
        &self,
        event_type: EventType,
        announcement: Announcement,
    ) -> Result<StateRecord> {
        self.announce(event_type, announcement)
            .await?
            .ok_or_else(|| EventError::validation(format!("{} does not change state", event_type)))
    }
}

fn with_execution(announcement: Announcement, execution: Option<&str>) -> Announcement {
    match execution {
        Some(execution) => announcement.execution(execution),
        None => announcement,
    }
}
