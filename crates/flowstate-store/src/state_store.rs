use crate::error::Result;
use crate::query::{Count, Page, QueryFilter, StateSummary};
use crate::record::StateRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowstate_core::{State, StateKey};
use std::collections::{BTreeMap, HashMap};

/// Durable per-payload state records.
///
/// `claim` is the only guarded write; every other transition is last-write-wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reserve a payload for `execution`.
    ///
    /// Fails with `AlreadyClaimed` while the record is CLAIMED or PROCESSING.
    async fn claim(&self, key: &StateKey, execution: &str, at: DateTime<Utc>) -> Result<StateRecord>;

    /// Mark the payload PROCESSING, appending `execution` unless it is already last
    async fn start(&self, key: &StateKey, execution: &str, at: DateTime<Utc>) -> Result<StateRecord>;

    /// Mark the payload COMPLETED; `None` keeps any outputs already recorded
    async fn complete(
        &self,
        key: &StateKey,
        outputs: Option<&[String]>,
        at: DateTime<Utc>,
    ) -> Result<StateRecord>;

    /// Replace `outputs` without touching the state
    async fn set_outputs(
        &self,
        key: &StateKey,
        outputs: &[String],
        at: DateTime<Utc>,
    ) -> Result<Option<StateRecord>>;

    async fn fail(&self, key: &StateKey, message: &str, at: DateTime<Utc>) -> Result<StateRecord>;

    async fn invalidate(&self, key: &StateKey, message: &str, at: DateTime<Utc>)
        -> Result<StateRecord>;

    async fn abort(&self, key: &StateKey, at: DateTime<Utc>) -> Result<StateRecord>;

    async fn get(&self, key: &StateKey) -> Result<Option<StateRecord>>;

    /// Batch lookup. Duplicate keys collapse, unknown keys are omitted.
    async fn get_many(&self, keys: &[StateKey]) -> Result<Vec<StateRecord>>;

    /// One page of a partition range query
    async fn query(
        &self,
        collections_workflow: &str,
        filter: &QueryFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page>;

    /// Count matches, stopping once more than `limit` have been seen
    async fn count(
        &self,
        collections_workflow: &str,
        filter: &QueryFilter,
        limit: Option<usize>,
    ) -> Result<Count>;

    /// Remove a record. Absent records are not an error.
    async fn delete(&self, key: &StateKey) -> Result<()>;

    async fn get_state(&self, key: &StateKey) -> Result<Option<State>> {
        Ok(self.get(key).await?.map(|record| record.state))
    }

    /// States keyed by payload id
    async fn get_states(&self, keys: &[StateKey]) -> Result<HashMap<String, State>> {
        Ok(self
            .get_many(keys)
            .await?
            .into_iter()
            .map(|record| (record.payload_id, record.state))
            .collect())
    }

    /// Follow cursors until `limit` records or the end of the partition
    async fn get_items(
        &self,
        collections_workflow: &str,
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<StateRecord>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        while items.len() < limit {
            let page = self
                .query(
                    collections_workflow,
                    filter,
                    limit - items.len(),
                    cursor.as_deref(),
                )
                .await?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(items)
    }

    /// Capped counts for every state in a partition
    async fn summary(
        &self,
        collections_workflow: &str,
        since: Option<&str>,
        limit: Option<usize>,
    ) -> Result<StateSummary> {
        let key = StateKey::new(collections_workflow, "")?;
        let mut counts = BTreeMap::new();

        for state in State::ALL {
            let mut filter = QueryFilter::default().state(state);
            filter.since = since.map(str::to_string);
            counts.insert(state, self.count(collections_workflow, &filter, limit).await?);
        }

        Ok(StateSummary {
            collections: key.collections().to_string(),
            workflow: key.workflow().to_string(),
            counts,
        })
    }
}
