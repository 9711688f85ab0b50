//! Range-query filters, continuation cursors, pages and capped counts

use crate::error::{Result, StoreError};
use crate::record::StateRecord;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use flowstate_core::{parse_since, State};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ordering used by a range query within one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortIndex {
    /// Item ids (the table's own sort key)
    #[serde(rename = "default")]
    ItemIds,
    StateUpdated,
    #[default]
    Updated,
}

impl SortIndex {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortIndex::ItemIds => "default",
            SortIndex::StateUpdated => "state_updated",
            SortIndex::Updated => "updated",
        }
    }

    /// Column holding the sort value
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortIndex::ItemIds => "itemids",
            SortIndex::StateUpdated => "state_updated",
            SortIndex::Updated => "updated",
        }
    }
}

impl FromStr for SortIndex {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(SortIndex::ItemIds),
            "state_updated" => Ok(SortIndex::StateUpdated),
            "updated" => Ok(SortIndex::Updated),
            other => Err(StoreError::validation(format!("unknown sort index: {}", other))),
        }
    }
}

/// Filters and ordering for `query` and `count`
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Only records currently in this state
    pub state: Option<State>,
    /// Relative window on `updated`, e.g. `1h`
    pub since: Option<String>,
    /// Only records whose `last_error` starts with this
    pub error_prefix: Option<String>,
    pub sort_index: SortIndex,
    pub sort_ascending: bool,
}

impl QueryFilter {
    pub fn state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    pub fn error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.error_prefix = Some(prefix.into());
        self
    }

    pub fn sort(mut self, sort_index: SortIndex, ascending: bool) -> Self {
        self.sort_index = sort_index;
        self.sort_ascending = ascending;
        self
    }

    /// Resolve the `since` window against `now`
    pub(crate) fn resolve(&self, now: DateTime<Utc>) -> Result<ResolvedFilter<'_>> {
        let cutoff = match &self.since {
            Some(since) => Some(now - parse_since(since)?),
            None => None,
        };
        Ok(ResolvedFilter {
            filter: self,
            cutoff,
        })
    }
}

/// A filter whose `since` window has been pinned to an instant
pub(crate) struct ResolvedFilter<'a> {
    pub filter: &'a QueryFilter,
    pub cutoff: Option<DateTime<Utc>>,
}

impl ResolvedFilter<'_> {
    /// Post-read filters the backing index cannot evaluate
    pub fn matches(&self, record: &StateRecord) -> bool {
        if let Some(cutoff) = self.cutoff {
            if record.updated < cutoff {
                return false;
            }
        }
        if let Some(prefix) = &self.filter.error_prefix {
            return record
                .last_error
                .as_deref()
                .map(|error| error.starts_with(prefix.as_str()))
                .unwrap_or(false);
        }
        true
    }

    /// Rows sorted newest-first by `updated` can stop at the first row outside
    /// the window
    pub fn window_exhausted(&self, record: &StateRecord) -> bool {
        match self.cutoff {
            Some(cutoff) => {
                self.filter.sort_index == SortIndex::Updated
                    && !self.filter.sort_ascending
                    && record.updated < cutoff
            }
            None => false,
        }
    }
}

/// Position of the last row handed to a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "i")]
    pub index: SortIndex,
    #[serde(rename = "v")]
    pub sort_value: String,
    #[serde(rename = "k")]
    pub itemids: String,
}

impl Cursor {
    /// Opaque token handed back to callers
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| StoreError::validation(format!("malformed cursor: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::validation(format!("malformed cursor: {}", e)))
    }
}

/// One page of a range query
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: Vec<StateRecord>,
    /// Present when more matching rows may follow
    #[serde(rename = "nextkey", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of a capped count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Exact(u64),
    /// More than the limit matched; scanning stopped
    AtLeast(u64),
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Exact(n) => write!(f, "{}", n),
            Count::AtLeast(limit) => write!(f, "{}+", limit),
        }
    }
}

impl Serialize for Count {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Count::Exact(n) => serializer.serialize_u64(*n),
            Count::AtLeast(_) => serializer.collect_str(self),
        }
    }
}

/// Per-state counts for one partition
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub collections: String,
    pub workflow: String,
    pub counts: BTreeMap<State, Count>,
}
