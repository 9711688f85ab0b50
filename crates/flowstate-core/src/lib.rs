//! flowstate core types
//!
//! Shared by the state store, the event log and the workflow event manager:
//! - payload identifier <-> state key codec
//! - lifecycle states, event-log measures, engine statuses and event types
//! - timestamp and relative-duration parsing
//! - layered settings

pub mod config;
pub mod error;
pub mod keys;
pub mod state;
pub mod time;

pub use config::Settings;
pub use error::{Error, Result};
pub use keys::{decode, encode, to_payload_id, StateKey, PAYLOAD_ID_REGEX};
pub use state::{EngineStatus, EventState, EventType, State};
pub use time::{format_timestamp, parse_since, parse_utc_timestamp};
