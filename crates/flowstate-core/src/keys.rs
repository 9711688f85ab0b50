//! Payload identifier <-> state key codec
//!
//! A payload identifier looks like
//! `<collections>/workflow-<workflow>/<item-id>[/<item-id>...]` and maps onto the
//! store's two-part key:
//!
//! - partition key `collections_workflow`: `<collections>_<workflow>`
//! - sort key `itemids`: the slash-joined item ids
//!
//! The mapping is lossless: [`decode`] followed by [`StateKey::payload_id`]
//! reproduces the original identifier exactly.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal separating the collections from the workflow name in a payload id
pub const WORKFLOW_MARKER: &str = "/workflow-";

lazy_static! {
    /// Matches a payload id that carries at least one item id
    pub static ref PAYLOAD_ID_REGEX: Regex =
        Regex::new(r"^(?P<collections>.+)/workflow-(?P<workflow>[^/]+)/(?P<itemids>.+)$")
            .expect("payload id regex is valid");
}

/// Two-part key addressing one state record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    /// Partition key: `<collections>_<workflow>`
    pub collections_workflow: String,
    /// Sort key: slash-joined item ids
    pub itemids: String,
}

impl StateKey {
    /// Build a key from an already-encoded partition and sort key.
    ///
    /// The partition key must split into collections and workflow on its last `_`.
    pub fn new(collections_workflow: impl Into<String>, itemids: impl Into<String>) -> Result<Self> {
        let key = Self {
            collections_workflow: collections_workflow.into(),
            itemids: itemids.into(),
        };
        split_partition(&key.collections_workflow)?;
        Ok(key)
    }

    /// Collections half of the partition key
    pub fn collections(&self) -> &str {
        self.collections_workflow
            .rsplit_once('_')
            .map(|(collections, _)| collections)
            .unwrap_or(&self.collections_workflow)
    }

    /// Workflow half of the partition key
    pub fn workflow(&self) -> &str {
        self.collections_workflow
            .rsplit_once('_')
            .map(|(_, workflow)| workflow)
            .unwrap_or("")
    }

    /// Reconstruct the payload identifier for this key
    pub fn payload_id(&self) -> String {
        format!(
            "{}{}{}/{}",
            self.collections(),
            WORKFLOW_MARKER,
            self.workflow(),
            self.itemids
        )
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload_id())
    }
}

/// Encode a payload's collections, workflow and item ids into a state key
pub fn encode<S: AsRef<str>>(collections: &str, workflow: &str, item_ids: &[S]) -> Result<StateKey> {
    if collections.is_empty() {
        return Err(Error::validation("collections must not be empty"));
    }
    if collections.contains(WORKFLOW_MARKER) {
        return Err(Error::validation(format!(
            "collections must not contain '{}': {}",
            WORKFLOW_MARKER, collections
        )));
    }
    validate_workflow(workflow).map_err(Error::Validation)?;

    let itemids = item_ids
        .iter()
        .map(|id| id.as_ref())
        .collect::<Vec<_>>()
        .join("/");

    Ok(StateKey {
        collections_workflow: format!("{}_{}", collections, workflow),
        itemids,
    })
}

/// Decode a payload identifier into its state key
pub fn decode(payload_id: &str) -> Result<StateKey> {
    let (collections, rest) = payload_id.split_once(WORKFLOW_MARKER).ok_or_else(|| {
        Error::malformed_identifier(format!(
            "'{}' does not contain '{}'",
            payload_id, WORKFLOW_MARKER
        ))
    })?;

    let (workflow, itemids) = rest.split_once('/').unwrap_or((rest, ""));

    if collections.is_empty() {
        return Err(Error::malformed_identifier(format!(
            "'{}' has no collections",
            payload_id
        )));
    }
    validate_workflow(workflow)
        .map_err(|msg| Error::malformed_identifier(format!("'{}': {}", payload_id, msg)))?;

    Ok(StateKey {
        collections_workflow: format!("{}_{}", collections, workflow),
        itemids: itemids.to_string(),
    })
}

/// Reconstruct a payload identifier from a partition and sort key
pub fn to_payload_id(collections_workflow: &str, itemids: &str) -> Result<String> {
    let (collections, workflow) = split_partition(collections_workflow)?;
    Ok(format!("{}{}{}/{}", collections, WORKFLOW_MARKER, workflow, itemids))
}

fn split_partition(collections_workflow: &str) -> Result<(&str, &str)> {
    match collections_workflow.rsplit_once('_') {
        Some((collections, workflow)) if !collections.is_empty() && !workflow.is_empty() => {
            Ok((collections, workflow))
        }
        _ => Err(Error::malformed_identifier(format!(
            "partition key '{}' is not <collections>_<workflow>",
            collections_workflow
        ))),
    }
}

// '_' would make the partition key ambiguous on the way back
fn validate_workflow(workflow: &str) -> std::result::Result<(), String> {
    if workflow.is_empty() {
        return Err("workflow must not be empty".to_string());
    }
    if workflow.contains('/') || workflow.contains('_') {
        return Err(format!("workflow must not contain '/' or '_': {}", workflow));
    }
    Ok(())
}
