use chrono::{DateTime, Utc};
use flowstate_core::{State, StateKey};
use serde::{Deserialize, Serialize};

/// External view of one payload's state record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub payload_id: String,
    pub collections: String,
    pub workflow: String,
    /// Slash-joined item ids
    pub items: String,
    pub state: State,
    /// Raw `<STATE>_<timestamp>` value as stored
    #[serde(skip)]
    pub state_updated: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Execution references, most recent last
    #[serde(default)]
    pub executions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StateRecord {
    pub fn key(&self) -> StateKey {
        StateKey {
            collections_workflow: format!("{}_{}", self.collections, self.workflow),
            itemids: self.items.clone(),
        }
    }

    /// Most recent execution reference
    pub fn latest_execution(&self) -> Option<&str> {
        self.executions.last().map(String::as_str)
    }
}
