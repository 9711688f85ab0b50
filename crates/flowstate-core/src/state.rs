//! Workflow lifecycle states, event-log measures, engine statuses and
//! workflow event types

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a payload
///
/// `CLAIMED -> PROCESSING -> {COMPLETED | FAILED | INVALID | ABORTED}`; a new
/// claim restarts the cycle for a rerun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Reserved for dispatch, no execution accepted yet
    Claimed,
    /// The workflow engine accepted the execution
    Processing,
    Completed,
    Failed,
    /// Malformed or unrecoverable input, excluded from blind retries
    Invalid,
    Aborted,
}

impl State {
    pub const ALL: [State; 6] = [
        State::Claimed,
        State::Processing,
        State::Completed,
        State::Failed,
        State::Invalid,
        State::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Claimed => "CLAIMED",
            State::Processing => "PROCESSING",
            State::Completed => "COMPLETED",
            State::Failed => "FAILED",
            State::Invalid => "INVALID",
            State::Aborted => "ABORTED",
        }
    }

    /// Terminal for the current execution attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Completed | State::Failed | State::Invalid | State::Aborted
        )
    }

    /// States that block a new claim
    pub fn is_in_flight(&self) -> bool {
        matches!(self, State::Claimed | State::Processing)
    }

    /// States that carry a `last_error`
    pub fn carries_error(&self) -> bool {
        matches!(self, State::Failed | State::Invalid)
    }

    /// Parse the state out of a composite `<STATE>_<timestamp>` value.
    ///
    /// Only the prefix is inspected; the timestamp suffix is ignored.
    pub fn from_state_updated(value: &str) -> Option<State> {
        State::ALL.into_iter().find(|state| {
            value
                .strip_prefix(state.as_str())
                .map(|rest| rest.is_empty() || rest.starts_with('_'))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown state: {}", s)))
    }
}

/// Measure recorded in the event log for one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Claimed,
    Processing,
    Completed,
    Failed,
    Invalid,
    Aborted,
    /// Pseudo-terminal marker, only produced by synthetic data
    Succeeded,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Claimed => "CLAIMED",
            EventState::Processing => "PROCESSING",
            EventState::Completed => "COMPLETED",
            EventState::Failed => "FAILED",
            EventState::Invalid => "INVALID",
            EventState::Aborted => "ABORTED",
            EventState::Succeeded => "SUCCEEDED",
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, EventState::Succeeded)
    }
}

impl From<State> for EventState {
    fn from(state: State) -> Self {
        match state {
            State::Claimed => EventState::Claimed,
            State::Processing => EventState::Processing,
            State::Completed => EventState::Completed,
            State::Failed => EventState::Failed,
            State::Invalid => EventState::Invalid,
            State::Aborted => EventState::Aborted,
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCEEDED" => Ok(EventState::Succeeded),
            other => other.parse::<State>().map(EventState::from),
        }
    }
}

/// Terminal status reported by the external workflow engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Succeeded => "SUCCEEDED",
            EngineStatus::Failed => "FAILED",
            EngineStatus::Aborted => "ABORTED",
            EngineStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCEEDED" => Ok(EngineStatus::Succeeded),
            "FAILED" => Ok(EngineStatus::Failed),
            "ABORTED" => Ok(EngineStatus::Aborted),
            "TIMED_OUT" => Ok(EngineStatus::TimedOut),
            other => Err(Error::validation(format!(
                "status does not support updates: {}",
                other
            ))),
        }
    }
}

/// Kind of workflow event announced to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ClaimedProcessing,
    StartedProcessing,
    AlreadyInvalid,
    AlreadyProcessing,
    AlreadyCompleted,
    DuplicateIdEncountered,
    Failed,
    TimedOut,
    Succeeded,
    Invalid,
    Aborted,
    RecordExtractFailed,
    NotAProcessPayload,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::ClaimedProcessing,
        EventType::StartedProcessing,
        EventType::AlreadyInvalid,
        EventType::AlreadyProcessing,
        EventType::AlreadyCompleted,
        EventType::DuplicateIdEncountered,
        EventType::Failed,
        EventType::TimedOut,
        EventType::Succeeded,
        EventType::Invalid,
        EventType::Aborted,
        EventType::RecordExtractFailed,
        EventType::NotAProcessPayload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ClaimedProcessing => "CLAIMED_PROCESSING",
            EventType::StartedProcessing => "STARTED_PROCESSING",
            EventType::AlreadyInvalid => "ALREADY_INVALID",
            EventType::AlreadyProcessing => "ALREADY_PROCESSING",
            EventType::AlreadyCompleted => "ALREADY_COMPLETED",
            EventType::DuplicateIdEncountered => "DUPLICATE_ID_ENCOUNTERED",
            EventType::Failed => "FAILED",
            EventType::TimedOut => "TIMED_OUT",
            EventType::Succeeded => "SUCCEEDED",
            EventType::Invalid => "INVALID",
            EventType::Aborted => "ABORTED",
            EventType::RecordExtractFailed => "RECORD_EXTRACT_FAILED",
            EventType::NotAProcessPayload => "NOT_A_PROCESS_PAYLOAD",
        }
    }

    /// State the payload moves to when this event is announced, if any
    pub fn target_state(&self) -> Option<State> {
        match self {
            EventType::ClaimedProcessing => Some(State::Claimed),
            EventType::StartedProcessing => Some(State::Processing),
            EventType::Succeeded => Some(State::Completed),
            EventType::Failed | EventType::TimedOut => Some(State::Failed),
            EventType::Invalid => Some(State::Invalid),
            EventType::Aborted => Some(State::Aborted),
            _ => None,
        }
    }

    /// The `ALREADY_<STATE>` event for a payload skipped in `state`
    pub fn already(state: State) -> Option<EventType> {
        match state {
            State::Invalid => Some(EventType::AlreadyInvalid),
            State::Processing => Some(EventType::AlreadyProcessing),
            State::Completed => Some(EventType::AlreadyCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown event type: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_prefix_parsing_ignores_timestamp() {
        assert_eq!(
            State::from_state_updated("COMPLETED_2024-01-01T00:00:00.000000Z"),
            Some(State::Completed)
        );
        assert_eq!(
            State::from_state_updated("CLAIMED_2030-12-31T23:59:59.999999Z"),
            Some(State::Claimed)
        );
        assert_eq!(State::from_state_updated("FAILED"), Some(State::Failed));
        assert_eq!(State::from_state_updated("FAILEDX_2024"), None);
        assert_eq!(State::from_state_updated("RUNNING_2024"), None);
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("processing".parse::<State>().is_err());
    }

    #[test]
    fn test_state_serde_uses_screaming_case() {
        assert_eq!(serde_json::to_string(&State::Invalid).unwrap(), "\"INVALID\"");
        let state: State = serde_json::from_str("\"ABORTED\"").unwrap();
        assert_eq!(state, State::Aborted);
    }

    #[test]
    fn test_state_classification() {
        assert!(State::Claimed.is_in_flight());
        assert!(State::Processing.is_in_flight());
        assert!(!State::Completed.is_in_flight());
        assert!(State::Aborted.is_terminal());
        assert!(State::Invalid.carries_error());
        assert!(!State::Aborted.carries_error());
    }

    #[test]
    fn test_event_state_synthetic_marker() {
        assert!(EventState::Succeeded.is_synthetic());
        assert_eq!("SUCCEEDED".parse::<EventState>().unwrap(), EventState::Succeeded);
        assert_eq!(EventState::from(State::Failed), EventState::Failed);
        assert!(!EventState::Failed.is_synthetic());
    }

    #[test]
    fn test_engine_status_rejects_unknown() {
        assert_eq!("TIMED_OUT".parse::<EngineStatus>().unwrap(), EngineStatus::TimedOut);
        assert!("RUNNING".parse::<EngineStatus>().is_err());
    }

    #[test]
    fn test_event_type_targets() {
        assert_eq!(EventType::TimedOut.target_state(), Some(State::Failed));
        assert_eq!(EventType::ClaimedProcessing.target_state(), Some(State::Claimed));
        assert_eq!(EventType::DuplicateIdEncountered.target_state(), None);
        assert_eq!(EventType::already(State::Completed), Some(EventType::AlreadyCompleted));
        assert_eq!(EventType::already(State::Failed), None);
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
    }
}
