//! SQLite-backed state store
//!
//! One row per payload, keyed by `(collections_workflow, itemids)`. The state
//! and its transition time are packed into `state_updated` as
//! `<STATE>_<timestamp>`, so a state filter is a range scan on that column.
//! `claim` is an upsert guarded by a `WHERE` on the conflicting row; every
//! other transition is an unguarded upsert.

use crate::error::{Result, StoreError};
use crate::metrics::{self, OperationTimer};
use crate::query::{Count, Cursor, Page, QueryFilter, ResolvedFilter, SortIndex};
use crate::record::StateRecord;
use crate::state_store::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowstate_core::config::StateDbSettings;
use flowstate_core::{format_timestamp, parse_utc_timestamp, State, StateKey};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const STORE_TYPE: &str = "sqlite";

/// Keys per batched lookup statement
const GET_MANY_CHUNK: usize = 100;

const RECORD_COLUMNS: &str =
    "collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error";

const CLAIM_SQL: &str = r#"
    INSERT INTO state_records
        (collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error)
    VALUES (?1, ?2, ?3, ?4, ?4, json_array(?5), NULL, NULL)
    ON CONFLICT (collections_workflow, itemids) DO UPDATE SET
        state_updated = excluded.state_updated,
        updated = excluded.updated,
        executions = CASE
            WHEN json_extract(state_records.executions, '$[#-1]') IS ?5 THEN state_records.executions
            ELSE json_insert(state_records.executions, '$[#]', ?5)
        END,
        last_error = NULL
    WHERE substr(state_records.state_updated, 1, 8) != 'CLAIMED_'
      AND substr(state_records.state_updated, 1, 11) != 'PROCESSING_'
    RETURNING collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error
"#;

const START_SQL: &str = r#"
    INSERT INTO state_records
        (collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error)
    VALUES (?1, ?2, ?3, ?4, ?4, json_array(?5), NULL, NULL)
    ON CONFLICT (collections_workflow, itemids) DO UPDATE SET
        state_updated = excluded.state_updated,
        updated = excluded.updated,
        executions = CASE
            WHEN json_extract(state_records.executions, '$[#-1]') IS ?5 THEN state_records.executions
            ELSE json_insert(state_records.executions, '$[#]', ?5)
        END,
        last_error = NULL
    RETURNING collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error
"#;

const COMPLETE_SQL: &str = r#"
    INSERT INTO state_records
        (collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error)
    VALUES (?1, ?2, ?3, ?4, ?4, '[]', ?5, NULL)
    ON CONFLICT (collections_workflow, itemids) DO UPDATE SET
        state_updated = excluded.state_updated,
        updated = excluded.updated,
        outputs = COALESCE(excluded.outputs, state_records.outputs),
        last_error = NULL
    RETURNING collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error
"#;

/// Terminal write carrying `last_error`; abort binds NULL
const TERMINAL_SQL: &str = r#"
    INSERT INTO state_records
        (collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error)
    VALUES (?1, ?2, ?3, ?4, ?4, '[]', NULL, ?5)
    ON CONFLICT (collections_workflow, itemids) DO UPDATE SET
        state_updated = excluded.state_updated,
        updated = excluded.updated,
        last_error = excluded.last_error
    RETURNING collections_workflow, itemids, state_updated, created, updated, executions, outputs, last_error
"#;

/// SQLite-backed [`StateStore`]
pub struct SqliteStateStore {
    pool: SqlitePool,
    scan_page_size: usize,
    limit_cap: usize,
}

impl SqliteStateStore {
    /// Open (creating if missing) the database at `url`.
    ///
    /// URL format: `sqlite:///path/to/state.db` or `sqlite://state.db`
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        info!("Initializing SQLite state store: {}", url);

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite state store initialized successfully");
        Ok(store)
    }

    /// Open the store described by `settings`
    pub async fn from_settings(settings: &StateDbSettings) -> Result<Self> {
        Ok(Self::connect(&settings.url, settings.max_connections)
            .await?
            .with_scan_page_size(settings.scan_page_size))
    }

    /// Create an in-memory store for testing.
    ///
    /// Every connection to `sqlite::memory:` is its own database, so the pool
    /// holds exactly one connection for its whole life.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self {
            pool,
            scan_page_size: 100,
            limit_cap: 1000,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Raw rows read per round trip during `query` and `count`
    pub fn with_scan_page_size(mut self, scan_page_size: usize) -> Self {
        self.scan_page_size = scan_page_size.max(1);
        self
    }

    /// Largest `limit` honoured by `query`
    pub fn with_limit_cap(mut self, limit_cap: usize) -> Self {
        self.limit_cap = limit_cap.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing state store schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_records (
                collections_workflow TEXT NOT NULL,
                itemids TEXT NOT NULL,
                state_updated TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                executions TEXT NOT NULL DEFAULT '[]',
                outputs TEXT,
                last_error TEXT,
                PRIMARY KEY (collections_workflow, itemids)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_state_updated ON state_records(collections_workflow, state_updated, itemids)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_updated ON state_records(collections_workflow, updated, itemids)",
        )
        .execute(&self.pool)
        .await?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Run one of the transition upserts; `None` means a guarded write lost
    async fn upsert(
        &self,
        sql: &'static str,
        key: &StateKey,
        state: State,
        at: DateTime<Utc>,
        value: Option<String>,
    ) -> Result<Option<StateRecord>> {
        let now = format_timestamp(at);
        let row = sqlx::query(sql)
            .bind(&key.collections_workflow)
            .bind(&key.itemids)
            .bind(format!("{}_{}", state, now))
            .bind(&now)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                metrics::record_transition(state.as_str());
                Ok(Some(record_from_row(&row)?))
            }
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        operation: &'static str,
        sql: &'static str,
        key: &StateKey,
        state: State,
        at: DateTime<Utc>,
        value: Option<String>,
    ) -> Result<StateRecord> {
        let _timer = OperationTimer::new(operation, STORE_TYPE);
        let result = self.upsert(sql, key, state, at, value).await.and_then(|record| {
            record.ok_or_else(|| StoreError::CorruptRecord(format!("{} returned no row", key)))
        });
        observe(operation, result)
    }

    /// Read up to `scan_page_size` raw rows following `position`
    async fn scan_page(
        &self,
        collections_workflow: &str,
        filter: &QueryFilter,
        position: Option<&Cursor>,
    ) -> Result<Vec<StateRecord>> {
        let column = filter.sort_index.column();
        let (cmp, order) = if filter.sort_ascending {
            (">", "ASC")
        } else {
            ("<", "DESC")
        };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(RECORD_COLUMNS);
        qb.push(" FROM state_records WHERE collections_workflow = ");
        qb.push_bind(collections_workflow.to_string());

        if let Some(state) = filter.state {
            // '`' sorts immediately after '_'
            qb.push(" AND state_updated >= ");
            qb.push_bind(format!("{}_", state));
            qb.push(" AND state_updated < ");
            qb.push_bind(format!("{}`", state));
        }

        if let Some(position) = position {
            qb.push(format!(" AND ({} {} ", column, cmp));
            qb.push_bind(position.sort_value.clone());
            qb.push(format!(" OR ({} = ", column));
            qb.push_bind(position.sort_value.clone());
            qb.push(format!(" AND itemids {} ", cmp));
            qb.push_bind(position.itemids.clone());
            qb.push("))");
        }

        qb.push(format!(" ORDER BY {} {}, itemids {} LIMIT ", column, order, order));
        qb.push_bind(self.scan_page_size as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Walk the partition from `start`, handing every in-window row to `visit`
    /// until it returns `false` or the data runs out.
    ///
    /// Round trips are issued one after another. Returns the position of the
    /// last row visited when `visit` stopped the scan.
    async fn scan<F>(
        &self,
        collections_workflow: &str,
        resolved: &ResolvedFilter<'_>,
        start: Option<Cursor>,
        mut visit: F,
    ) -> Result<Option<Cursor>>
    where
        F: FnMut(StateRecord) -> bool + Send,
    {
        let filter = resolved.filter;
        let mut position = start;

        loop {
            let rows = self
                .scan_page(collections_workflow, filter, position.as_ref())
                .await?;
            let exhausted = rows.len() < self.scan_page_size;

            for record in rows {
                if resolved.window_exhausted(&record) {
                    return Ok(None);
                }
                let here = Cursor {
                    index: filter.sort_index,
                    sort_value: sort_value(&record, filter),
                    itemids: record.items.clone(),
                };
                let keep_going = if resolved.matches(&record) {
                    visit(record)
                } else {
                    true
                };
                position = Some(here);
                if !keep_going {
                    return Ok(position);
                }
            }

            if exhausted {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self), fields(payload_id = %key))]
    async fn claim(&self, key: &StateKey, execution: &str, at: DateTime<Utc>) -> Result<StateRecord> {
        let _timer = OperationTimer::new("claim", STORE_TYPE);

        let claimed = self
            .upsert(CLAIM_SQL, key, State::Claimed, at, Some(execution.to_string()))
            .await;

        let result = match claimed {
            Ok(Some(record)) => {
                debug!(execution, "Payload claimed");
                Ok(record)
            }
            Ok(None) => {
                metrics::record_claim_conflict();
                let existing = self.get(key).await?;
                warn!(
                    execution,
                    existing_state = ?existing.as_ref().map(|r| r.state),
                    "Payload already claimed"
                );
                Err(StoreError::AlreadyClaimed {
                    payload_id: key.payload_id(),
                    state: existing.as_ref().map(|r| r.state),
                    execution: existing
                        .as_ref()
                        .and_then(|r| r.latest_execution())
                        .map(str::to_string),
                })
            }
            Err(e) => Err(e),
        };
        observe("claim", result)
    }

    #[instrument(skip(self), fields(payload_id = %key))]
    async fn start(&self, key: &StateKey, execution: &str, at: DateTime<Utc>) -> Result<StateRecord> {
        self.transition(
            "start",
            START_SQL,
            key,
            State::Processing,
            at,
            Some(execution.to_string()),
        )
        .await
    }

    #[instrument(skip(self, outputs), fields(payload_id = %key))]
    async fn complete(
        &self,
        key: &StateKey,
        outputs: Option<&[String]>,
        at: DateTime<Utc>,
    ) -> Result<StateRecord> {
        let outputs = outputs.map(serde_json::to_string).transpose()?;
        self.transition("complete", COMPLETE_SQL, key, State::Completed, at, outputs)
            .await
    }

    #[instrument(skip(self, outputs), fields(payload_id = %key))]
    async fn set_outputs(
        &self,
        key: &StateKey,
        outputs: &[String],
        at: DateTime<Utc>,
    ) -> Result<Option<StateRecord>> {
        let _timer = OperationTimer::new("set_outputs", STORE_TYPE);
        let outputs = serde_json::to_string(outputs)?;

        let sql = format!(
            "UPDATE state_records SET outputs = ?1, updated = ?2 \
             WHERE collections_workflow = ?3 AND itemids = ?4 RETURNING {}",
            RECORD_COLUMNS
        );
        let result = async {
            let row = sqlx::query(&sql)
                .bind(outputs)
                .bind(format_timestamp(at))
                .bind(&key.collections_workflow)
                .bind(&key.itemids)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(record_from_row).transpose()
        }
        .await;
        observe("set_outputs", result)
    }

    #[instrument(skip(self), fields(payload_id = %key))]
    async fn fail(&self, key: &StateKey, message: &str, at: DateTime<Utc>) -> Result<StateRecord> {
        self.transition(
            "fail",
            TERMINAL_SQL,
            key,
            State::Failed,
            at,
            Some(message.to_string()),
        )
        .await
    }

    #[instrument(skip(self), fields(payload_id = %key))]
    async fn invalidate(
        &self,
        key: &StateKey,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<StateRecord> {
        self.transition(
            "invalidate",
            TERMINAL_SQL,
            key,
            State::Invalid,
            at,
            Some(message.to_string()),
        )
        .await
    }

    #[instrument(skip(self), fields(payload_id = %key))]
    async fn abort(&self, key: &StateKey, at: DateTime<Utc>) -> Result<StateRecord> {
        self.transition("abort", TERMINAL_SQL, key, State::Aborted, at, None)
            .await
    }

    async fn get(&self, key: &StateKey) -> Result<Option<StateRecord>> {
        let _timer = OperationTimer::new("get", STORE_TYPE);
        let sql = format!(
            "SELECT {} FROM state_records WHERE collections_workflow = ?1 AND itemids = ?2",
            RECORD_COLUMNS
        );
        let result = async {
            let row = sqlx::query(&sql)
                .bind(&key.collections_workflow)
                .bind(&key.itemids)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(record_from_row).transpose()
        }
        .await;
        observe("get", result)
    }

    async fn get_many(&self, keys: &[StateKey]) -> Result<Vec<StateRecord>> {
        let _timer = OperationTimer::new("get_many", STORE_TYPE);
        let unique: Vec<&StateKey> = keys.iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut records = Vec::with_capacity(unique.len());

        for chunk in unique.chunks(GET_MANY_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
            qb.push(RECORD_COLUMNS);
            qb.push(" FROM state_records WHERE (collections_workflow, itemids) IN (");
            qb.push_values(chunk.iter(), |mut b, key| {
                b.push_bind(key.collections_workflow.clone())
                    .push_bind(key.itemids.clone());
            });
            qb.push(")");

            let rows = match qb.build().fetch_all(&self.pool).await {
                Ok(rows) => rows,
                Err(e) => return observe("get_many", Err(e.into())),
            };
            for row in &rows {
                records.push(observe("get_many", record_from_row(row))?);
            }
        }

        debug!(requested = keys.len(), found = records.len(), "Batch lookup");
        Ok(records)
    }

    #[instrument(skip(self, filter, cursor))]
    async fn query(
        &self,
        collections_workflow: &str,
        filter: &QueryFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let _timer = OperationTimer::new("query", STORE_TYPE);
        StateKey::new(collections_workflow, "")?;

        let limit = limit.clamp(1, self.limit_cap);
        let resolved = filter.resolve(Utc::now())?;
        let start = match cursor {
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                if cursor.index != filter.sort_index {
                    return Err(StoreError::validation(format!(
                        "cursor was issued for sort index '{}', not '{}'",
                        cursor.index.as_str(),
                        filter.sort_index.as_str()
                    )));
                }
                Some(cursor)
            }
            None => None,
        };

        let mut items = Vec::with_capacity(limit);
        let result = self
            .scan(collections_workflow, &resolved, start, |record| {
                items.push(record);
                items.len() < limit
            })
            .await;
        let stopped_at = observe("query", result)?;

        let next_cursor = stopped_at.map(|c| c.encode()).transpose()?;
        debug!(
            returned = items.len(),
            more = next_cursor.is_some(),
            "Range query page"
        );
        Ok(Page { items, next_cursor })
    }

    #[instrument(skip(self, filter))]
    async fn count(
        &self,
        collections_workflow: &str,
        filter: &QueryFilter,
        limit: Option<usize>,
    ) -> Result<Count> {
        let _timer = OperationTimer::new("count", STORE_TYPE);
        StateKey::new(collections_workflow, "")?;

        let resolved = filter.resolve(Utc::now())?;
        let mut seen: u64 = 0;
        let cap = limit.map(|l| l as u64);

        let result = self
            .scan(collections_workflow, &resolved, None, |_| {
                seen += 1;
                cap.map(|cap| seen <= cap).unwrap_or(true)
            })
            .await;
        observe("count", result)?;

        Ok(match cap {
            Some(cap) if seen > cap => Count::AtLeast(cap),
            _ => Count::Exact(seen),
        })
    }

    #[instrument(skip(self), fields(payload_id = %key))]
    async fn delete(&self, key: &StateKey) -> Result<()> {
        let _timer = OperationTimer::new("delete", STORE_TYPE);
        let result = sqlx::query(
            "DELETE FROM state_records WHERE collections_workflow = ?1 AND itemids = ?2",
        )
        .bind(&key.collections_workflow)
        .bind(&key.itemids)
        .execute(&self.pool)
        .await;

        let deleted = observe("delete", result.map_err(StoreError::from))?;
        debug!(rows = deleted.rows_affected(), "Deleted state record");
        Ok(())
    }
}

fn observe<T>(operation: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if !e.is_already_claimed() {
            metrics::record_store_error(operation, STORE_TYPE, e.kind());
        }
    }
    result
}

fn sort_value(record: &StateRecord, filter: &QueryFilter) -> String {
    match filter.sort_index {
        SortIndex::ItemIds => record.items.clone(),
        SortIndex::StateUpdated => record.state_updated.clone(),
        SortIndex::Updated => format_timestamp(record.updated),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<StateRecord> {
    let collections_workflow: String = row.try_get("collections_workflow")?;
    let itemids: String = row.try_get("itemids")?;
    let state_updated: String = row.try_get("state_updated")?;
    let created: String = row.try_get("created")?;
    let updated: String = row.try_get("updated")?;
    let executions: String = row.try_get("executions")?;
    let outputs: Option<String> = row.try_get("outputs")?;
    let last_error: Option<String> = row.try_get("last_error")?;

    let key = StateKey::new(collections_workflow, itemids)?;
    let state = State::from_state_updated(&state_updated).ok_or_else(|| {
        StoreError::CorruptRecord(format!("{}: bad state_updated '{}'", key, state_updated))
    })?;
    let timestamp = |value: &str| {
        parse_utc_timestamp(value)
            .map_err(|e| StoreError::CorruptRecord(format!("{}: {}", key, e)))
    };

    Ok(StateRecord {
        payload_id: key.payload_id(),
        collections: key.collections().to_string(),
        workflow: key.workflow().to_string(),
        items: key.itemids.clone(),
        state,
        created: timestamp(&created)?,
        updated: timestamp(&updated)?,
        state_updated,
        executions: serde_json::from_str(&executions)?,
        outputs: outputs.as_deref().map(serde_json::from_str).transpose()?,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, SubsecRound};
    use flowstate_core::decode;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn key(id: &str) -> StateKey {
        decode(id).unwrap()
    }

    async fn store() -> SqliteStateStore {
        SqliteStateStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_normal_lifecycle() {
        let store = store().await;
        let k = key("c/workflow-w/i1");
        let now = Utc::now();

        let claimed = store.claim(&k, "exec-1", now).await.unwrap();
        assert_eq!(claimed.state, State::Claimed);
        assert_eq!(claimed.payload_id, "c/workflow-w/i1");

        let started = store.start(&k, "exec-1", now).await.unwrap();
        assert_eq!(started.state, State::Processing);
        assert_eq!(started.executions, vec!["exec-1".to_string()]);

        let outputs = vec!["o1".to_string()];
        let completed = store.complete(&k, Some(&outputs), now).await.unwrap();
        assert_eq!(completed.state, State::Completed);
        assert_eq!(completed.outputs, Some(outputs));
        assert_eq!(completed.last_error, None);
        assert_eq!(completed.collections, "c");
        assert_eq!(completed.workflow, "w");
        assert_eq!(completed.items, "i1");

        assert_eq!(store.get_state(&k).await.unwrap(), Some(State::Completed));
    }

    #[tokio::test]
    async fn test_start_without_claim_creates_record() {
        let store = store().await;
        let k = key("c/workflow-w/direct");

        let record = store.start(&k, "exec-1", Utc::now()).await.unwrap();
        assert_eq!(record.state, State::Processing);
        assert_eq!(record.executions, vec!["exec-1".to_string()]);
        assert_eq!(record.created, record.updated);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(store().await);
        let k = key("c/workflow-w/contended");
        let now = Utc::now();

        let attempts = (0..10).map(|i| {
            let store = store.clone();
            let k = k.clone();
            tokio::spawn(async move { store.claim(&k, &format!("exec-{}", i), now).await })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            let err = result.as_ref().unwrap_err();
            assert!(err.is_already_claimed(), "unexpected error: {}", err);
        }

        let record = store.get(&k).await.unwrap().unwrap();
        assert_eq!(record.executions.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_conflict_reports_existing_attempt() {
        let store = store().await;
        let k = key("c/workflow-w/busy");
        let now = Utc::now();

        store.claim(&k, "exec-1", now).await.unwrap();
        store.start(&k, "exec-1", now).await.unwrap();

        match store.claim(&k, "exec-2", now).await {
            Err(StoreError::AlreadyClaimed {
                payload_id,
                state,
                execution,
            }) => {
                assert_eq!(payload_id, "c/workflow-w/busy");
                assert_eq!(state, Some(State::Processing));
                assert_eq!(execution.as_deref(), Some("exec-1"));
            }
            other => panic!("expected AlreadyClaimed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rerun_appends_execution() {
        let store = store().await;
        let k = key("c/workflow-w/rerun");
        let now = Utc::now();

        store.claim(&k, "exec-1", now).await.unwrap();
        store.start(&k, "exec-1", now).await.unwrap();
        store.fail(&k, "Boom: bad", now).await.unwrap();

        let later = now + ChronoDuration::seconds(5);
        let rerun = store.claim(&k, "exec-2", later).await.unwrap();
        assert_eq!(rerun.state, State::Claimed);
        assert_eq!(rerun.executions, vec!["exec-1".to_string(), "exec-2".to_string()]);
        assert_eq!(rerun.last_error, None);
        assert_eq!(rerun.created, now.trunc_subsecs(6));
        assert_eq!(rerun.updated, later.trunc_subsecs(6));

        let started = store.start(&k, "exec-2", later).await.unwrap();
        assert_eq!(started.executions.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = store().await;
        let k = key("c/workflow-w/twice");
        let now = Utc::now();
        let outputs = vec!["s3://bucket/out.json".to_string()];

        store.start(&k, "exec-1", now).await.unwrap();
        let first = store.complete(&k, Some(&outputs), now).await.unwrap();
        let second = store.complete(&k, Some(&outputs), now).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.executions, vec!["exec-1".to_string()]);

        // None keeps what is already there
        let third = store.complete(&k, None, now).await.unwrap();
        assert_eq!(third.outputs, Some(outputs));
    }

    #[tokio::test]
    async fn test_error_transitions_carry_last_error() {
        let store = store().await;
        let k = key("c/workflow-w/err");
        let now = Utc::now();

        let failed = store.fail(&k, "TimeoutError: slow", now).await.unwrap();
        assert_eq!(failed.state, State::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("TimeoutError: slow"));

        let invalid = store.invalidate(&k, "InvalidInput: nope", now).await.unwrap();
        assert_eq!(invalid.state, State::Invalid);
        assert_eq!(invalid.last_error.as_deref(), Some("InvalidInput: nope"));

        let aborted = store.abort(&k, now).await.unwrap();
        assert_eq!(aborted.state, State::Aborted);
        assert_eq!(aborted.last_error, None);
    }

    #[tokio::test]
    async fn test_set_outputs_only_touches_existing() {
        let store = store().await;
        let k = key("c/workflow-w/outs");
        let outputs = vec!["o1".to_string(), "o2".to_string()];

        assert!(store.set_outputs(&k, &outputs, Utc::now()).await.unwrap().is_none());

        store.start(&k, "exec-1", Utc::now()).await.unwrap();
        let record = store
            .set_outputs(&k, &outputs, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, State::Processing);
        assert_eq!(record.outputs, Some(outputs));
    }

    #[tokio::test]
    async fn test_get_many_collapses_duplicates_and_skips_unknown() {
        let store = store().await;
        let now = Utc::now();
        store.claim(&key("c/workflow-w/a"), "e", now).await.unwrap();
        store.claim(&key("c/workflow-w/b"), "e", now).await.unwrap();

        let keys = vec![
            key("c/workflow-w/a"),
            key("c/workflow-w/a"),
            key("c/workflow-w/b"),
            key("c/workflow-w/missing"),
        ];
        let records = store.get_many(&keys).await.unwrap();
        assert_eq!(records.len(), 2);

        let states = store.get_states(&keys).await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states.get("c/workflow-w/a"), Some(&State::Claimed));
        assert!(!states.contains_key("c/workflow-w/missing"));

        assert!(store.get_many(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let store = store().await;
        let k = key("c/workflow-w/nothing");
        assert!(store.get(&k).await.unwrap().is_none());
        assert!(store.get_state(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store().await;
        let k = key("c/workflow-w/gone");
        store.claim(&k, "e", Utc::now()).await.unwrap();

        store.delete(&k).await.unwrap();
        store.delete(&k).await.unwrap();
        assert!(store.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_prefix_query() {
        let store = store().await;
        let now = Utc::now();
        store.fail(&key("c/workflow-w/x"), "timeout: x", now).await.unwrap();
        store.fail(&key("c/workflow-w/y"), "timeout: y", now).await.unwrap();
        store.fail(&key("c/workflow-w/z"), "other", now).await.unwrap();
        store.complete(&key("c/workflow-w/ok"), None, now).await.unwrap();

        let filter = QueryFilter::default().error_prefix("timeout");
        let page = store.query("c_w", &filter, 10, None).await.unwrap();

        let mut ids: Vec<_> = page.items.iter().map(|r| r.items.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["x", "y"]);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_pagination_yields_every_match_once() {
        let store = store().await.with_scan_page_size(3);
        let base = Utc::now() - ChronoDuration::minutes(30);

        let mut expected = HashSet::new();
        for i in 0..25 {
            let k = key(&format!("c/workflow-w/item-{:02}", i));
            let at = base + ChronoDuration::seconds(i);
            if i % 3 == 0 {
                store.complete(&k, None, at).await.unwrap();
            } else {
                store.fail(&k, &format!("timeout: {}", i), at).await.unwrap();
                expected.insert(k.payload_id());
            }
        }

        let filter = QueryFilter::default().error_prefix("timeout");
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .query("c_w", &filter, 4, cursor.as_deref())
                .await
                .unwrap();
            assert!(page.items.len() <= 4);
            if page.next_cursor.is_some() {
                assert_eq!(page.items.len(), 4);
            }
            seen.extend(page.items.into_iter().map(|r| r.payload_id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), expected.len());
        assert_eq!(seen.iter().cloned().collect::<HashSet<_>>(), expected);

        // Newest first by default
        assert_eq!(seen.first().map(String::as_str), Some("c/workflow-w/item-23"));
    }

    #[tokio::test]
    async fn test_query_by_state_and_sort_index() {
        let store = store().await.with_scan_page_size(2);
        let now = Utc::now();
        for id in ["b", "a", "d", "c"] {
            store.claim(&key(&format!("c/workflow-w/{}", id)), "e", now).await.unwrap();
        }
        store.start(&key("c/workflow-w/d"), "e", now).await.unwrap();

        let filter = QueryFilter::default()
            .state(State::Claimed)
            .sort(SortIndex::ItemIds, true);
        let items = store.get_items("c_w", &filter, 10).await.unwrap();
        let ids: Vec<_> = items.iter().map(|r| r.items.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let filter = QueryFilter::default().state(State::Processing);
        let page = store.query("c_w", &filter, 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].items, "d");
    }

    #[tokio::test]
    async fn test_since_window_excludes_old_records() {
        let store = store().await;
        let now = Utc::now();
        store
            .complete(&key("c/workflow-w/old"), None, now - ChronoDuration::hours(3))
            .await
            .unwrap();
        store
            .complete(&key("c/workflow-w/new"), None, now - ChronoDuration::minutes(5))
            .await
            .unwrap();

        let filter = QueryFilter::default().since("1h");
        let page = store.query("c_w", &filter, 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].items, "new");

        let filter = QueryFilter::default()
            .since("1h")
            .sort(SortIndex::ItemIds, true);
        assert_eq!(
            store.count("c_w", &filter, None).await.unwrap(),
            Count::Exact(1)
        );
    }

    #[tokio::test]
    async fn test_count_caps_at_limit() {
        let store = store().await.with_scan_page_size(4);
        let now = Utc::now();
        for i in 0..6 {
            store
                .claim(&key(&format!("c/workflow-w/{}", i)), "e", now)
                .await
                .unwrap();
        }

        let filter = QueryFilter::default().state(State::Claimed);
        assert_eq!(store.count("c_w", &filter, Some(5)).await.unwrap().to_string(), "5+");
        assert_eq!(store.count("c_w", &filter, Some(6)).await.unwrap(), Count::Exact(6));
        assert_eq!(store.count("c_w", &filter, Some(10)).await.unwrap(), Count::Exact(6));
        assert_eq!(store.count("c_w", &filter, None).await.unwrap(), Count::Exact(6));
    }

    #[tokio::test]
    async fn test_summary_counts_every_state() {
        let store = store().await;
        let now = Utc::now();
        store.claim(&key("my-col_a/workflow-w/1"), "e", now).await.unwrap();
        store.fail(&key("my-col_a/workflow-w/2"), "x", now).await.unwrap();
        store.fail(&key("my-col_a/workflow-w/3"), "y", now).await.unwrap();

        let summary = store.summary("my-col_a_w", None, Some(100)).await.unwrap();
        assert_eq!(summary.collections, "my-col_a");
        assert_eq!(summary.workflow, "w");
        assert_eq!(summary.counts[&State::Claimed], Count::Exact(1));
        assert_eq!(summary.counts[&State::Failed], Count::Exact(2));
        assert_eq!(summary.counts[&State::Completed], Count::Exact(0));
        assert_eq!(summary.counts.len(), State::ALL.len());
    }

    #[tokio::test]
    async fn test_cursor_from_other_index_is_rejected() {
        let store = store().await;
        let now = Utc::now();
        for i in 0..3 {
            store.claim(&key(&format!("c/workflow-w/{}", i)), "e", now).await.unwrap();
        }

        let page = store
            .query("c_w", &QueryFilter::default(), 1, None)
            .await
            .unwrap();
        let cursor = page.next_cursor.unwrap();

        let filter = QueryFilter::default().sort(SortIndex::StateUpdated, false);
        let err = store.query("c_w", &filter, 1, Some(&cursor)).await.unwrap_err();
        assert!(err.is_validation());

        let err = store
            .query("c_w", &QueryFilter::default(), 1, Some("%%%"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_bad_partition_key_is_rejected() {
        let store = store().await;
        let err = store
            .query("nounderscore", &QueryFilter::default(), 10, None)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
