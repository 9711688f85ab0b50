//! Append-only log of state transitions for aggregate reporting
//!
//! Every transition becomes one immutable row carrying the payload's
//! dimensions, the event time in epoch milliseconds and the resulting state.
//! Rows are only ever read back as time-bucketed aggregates.

use crate::error::{Result, StoreError};
use crate::metrics::{self, OperationTimer};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use flowstate_core::config::EventDbSettings;
use flowstate_core::{parse_since, parse_utc_timestamp, EventState, StateKey};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// How validation failures on write are surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventLogMode {
    /// Return the validation error to the caller
    Strict,
    /// Log it and skip the write
    #[default]
    Lenient,
}

/// One validated transition ready to append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub workflow: String,
    pub collections: String,
    pub item_ids: String,
    pub execution_arn: String,
    pub event_time: DateTime<Utc>,
    pub state: EventState,
}

impl EventRecord {
    /// Validate the raw inputs of a transition
    pub fn new(key: &StateKey, state: EventState, event_time: &str, execution: &str) -> Result<Self> {
        let key = StateKey::new(key.collections_workflow.as_str(), key.itemids.as_str())?;
        if key.itemids.is_empty() {
            return Err(StoreError::validation(format!(
                "event for '{}' has no item ids",
                key.collections_workflow
            )));
        }
        if execution.is_empty() {
            return Err(StoreError::validation(format!(
                "event for '{}' has no execution reference",
                key
            )));
        }

        Ok(Self {
            workflow: key.workflow().to_string(),
            collections: key.collections().to_string(),
            item_ids: key.itemids.clone(),
            execution_arn: execution.to_string(),
            event_time: parse_utc_timestamp(event_time)?,
            state,
        })
    }
}

/// Transitions per time bucket and resulting state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketCount {
    pub bucket: DateTime<Utc>,
    pub state: EventState,
    /// Distinct item ids
    pub unique_count: u64,
    /// Total transitions
    pub count: u64,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Whether a backing store is configured
    fn is_enabled(&self) -> bool;

    /// Append one transition.
    ///
    /// Returns `Ok(false)` when nothing was written: the log is disabled, or the
    /// inputs were invalid and the log is lenient.
    async fn record_transition(
        &self,
        key: &StateKey,
        state: EventState,
        event_time: &str,
        execution: &str,
    ) -> Result<bool>;

    /// Counts grouped into `bucket`-sized windows (`1h`, `1d`) over the
    /// trailing `duration`
    async fn query_bucket(&self, bucket: &str, duration: &str) -> Result<Vec<BucketCount>>;

    /// Counts for the window from `start` hours ago to `end` hours ago,
    /// labelled with the window start
    async fn query_hour(&self, start: u32, end: u32) -> Result<Vec<BucketCount>>;
}

/// Event log used when no backing store is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledEventLog;

#[async_trait]
impl EventLog for DisabledEventLog {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn record_transition(
        &self,
        key: &StateKey,
        _state: EventState,
        _event_time: &str,
        _execution: &str,
    ) -> Result<bool> {
        debug!(payload_id = %key, "Event log disabled, transition not recorded");
        Ok(false)
    }

    async fn query_bucket(&self, _bucket: &str, _duration: &str) -> Result<Vec<BucketCount>> {
        Err(StoreError::EventLogDisabled)
    }

    async fn query_hour(&self, _start: u32, _end: u32) -> Result<Vec<BucketCount>> {
        Err(StoreError::EventLogDisabled)
    }
}

/// SQLite-backed [`EventLog`]
pub struct SqliteEventLog {
    pool: SqlitePool,
    mode: EventLogMode,
}

impl SqliteEventLog {
    pub async fn connect(url: &str, mode: EventLogMode) -> Result<Self> {
        info!("Initializing SQLite event log: {} ({:?})", url, mode);

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, mode).await
    }

    pub async fn from_settings(settings: &EventDbSettings) -> Result<Self> {
        let mode = if settings.strict {
            EventLogMode::Strict
        } else {
            EventLogMode::Lenient
        };
        Self::connect(&settings.url, mode).await
    }

    /// Create an in-memory log for testing
    pub async fn in_memory(mode: EventLogMode) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, mode).await
    }

    pub async fn from_pool(pool: SqlitePool, mode: EventLogMode) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow TEXT NOT NULL,
                collections TEXT NOT NULL,
                item_ids TEXT NOT NULL,
                execution_arn TEXT NOT NULL,
                event_time INTEGER NOT NULL,
                state TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_time ON workflow_events(event_time)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, mode })
    }

    pub fn mode(&self) -> EventLogMode {
        self.mode
    }

    /// Append an already-validated record
    pub async fn append(&self, record: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events (workflow, collections, item_ids, execution_arn, event_time, state)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.workflow)
        .bind(&record.collections)
        .bind(&record.item_ids)
        .bind(&record.execution_arn)
        .bind(record.event_time.timestamp_millis())
        .bind(record.state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate events in `[from, to]` into buckets of `bucket_ms` aligned on
    /// `origin` (epoch milliseconds)
    async fn aggregate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket_ms: i64,
        origin: i64,
    ) -> Result<Vec<BucketCount>> {
        let rows = sqlx::query(
            r#"
            WITH data AS (
                SELECT
                    ?2 + ((event_time - ?2) / ?1) * ?1 AS bucket,
                    state,
                    item_ids,
                    COUNT(*) AS n
                FROM workflow_events
                WHERE event_time BETWEEN ?3 AND ?4
                GROUP BY bucket, state, item_ids
            )
            SELECT bucket, state, COUNT(*) AS unique_count, SUM(n) AS count
            FROM data
            GROUP BY bucket, state
            ORDER BY bucket, state
            "#,
        )
        .bind(bucket_ms)
        .bind(origin)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let bucket: i64 = row.try_get("bucket")?;
                let state: String = row.try_get("state")?;
                let unique_count: i64 = row.try_get("unique_count")?;
                let count: i64 = row.try_get("count")?;

                Ok(BucketCount {
                    bucket: Utc.timestamp_millis_opt(bucket).single().ok_or_else(|| {
                        StoreError::CorruptRecord(format!("bucket out of range: {}", bucket))
                    })?,
                    state: state.parse().map_err(|_| {
                        StoreError::CorruptRecord(format!("unknown event state '{}'", state))
                    })?,
                    unique_count: unique_count as u64,
                    count: count as u64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    fn is_enabled(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(payload_id = %key))]
    async fn record_transition(
        &self,
        key: &StateKey,
        state: EventState,
        event_time: &str,
        execution: &str,
    ) -> Result<bool> {
        let _timer = OperationTimer::new("record_transition", "sqlite_events");

        let record = match EventRecord::new(key, state, event_time, execution) {
            Ok(record) => record,
            Err(e) if self.mode == EventLogMode::Lenient && e.is_validation() => {
                warn!(error = %e, "Skipping invalid event record");
                metrics::record_event_log_write("skipped");
                return Ok(false);
            }
            Err(e) => {
                metrics::record_event_log_write("failed");
                return Err(e);
            }
        };

        match self.append(&record).await {
            Ok(()) => {
                metrics::record_event_log_write("recorded");
                debug!(state = %record.state, "Transition recorded");
                Ok(true)
            }
            Err(e) => {
                metrics::record_event_log_write("failed");
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    async fn query_bucket(&self, bucket: &str, duration: &str) -> Result<Vec<BucketCount>> {
        let _timer = OperationTimer::new("query_bucket", "sqlite_events");
        let bucket_ms = parse_since(bucket)?.num_milliseconds();
        if bucket_ms <= 0 {
            return Err(StoreError::validation(format!("bucket size must be positive: {}", bucket)));
        }
        let now = Utc::now();
        let from = now - parse_since(duration)?;
        self.aggregate(from, now, bucket_ms, 0).await
    }

    #[instrument(skip(self))]
    async fn query_hour(&self, start: u32, end: u32) -> Result<Vec<BucketCount>> {
        let _timer = OperationTimer::new("query_hour", "sqlite_events");
        if end > start {
            return Err(StoreError::validation(format!(
                "window end ({}h ago) is before its start ({}h ago)",
                end, start
            )));
        }
        let now = Utc::now();
        let from = now - Duration::hours(i64::from(start));
        let to = now - Duration::hours(i64::from(end));
        // One bucket spanning the whole window, labelled with its start
        let span = (to - from).num_milliseconds() + 1;
        self.aggregate(from, to, span, from.timestamp_millis()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstate_core::{decode, format_timestamp, State};

    fn key(id: &str) -> StateKey {
        decode(id).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_log_distinguishes_from_empty() {
        let log = DisabledEventLog;
        assert!(!log.is_enabled());
        let written = log
            .record_transition(&key("c/workflow-w/i"), State::Claimed.into(), "2024-01-01T00:00:00Z", "e")
            .await
            .unwrap();
        assert!(!written);

        assert!(matches!(
            log.query_bucket("1h", "1d").await,
            Err(StoreError::EventLogDisabled)
        ));
        assert!(matches!(
            log.query_hour(2, 1).await,
            Err(StoreError::EventLogDisabled)
        ));

        let enabled = SqliteEventLog::in_memory(EventLogMode::Lenient).await.unwrap();
        assert!(enabled.query_bucket("1h", "1d").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strict_mode_surfaces_validation_errors() {
        let log = SqliteEventLog::in_memory(EventLogMode::Strict).await.unwrap();

        let err = log
            .record_transition(&key("c/workflow-w/i"), State::Failed.into(), "yesterday", "e")
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let no_items = StateKey {
            collections_workflow: "c_w".to_string(),
            itemids: String::new(),
        };
        let err = log
            .record_transition(&no_items, State::Failed.into(), "2024-01-01T00:00:00Z", "e")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_lenient_mode_skips_invalid_records() {
        let log = SqliteEventLog::in_memory(EventLogMode::Lenient).await.unwrap();
        let now = format_timestamp(Utc::now());

        let written = log
            .record_transition(&key("c/workflow-w/i"), State::Failed.into(), "not a time", "e")
            .await
            .unwrap();
        assert!(!written);

        let written = log
            .record_transition(&key("c/workflow-w/i"), State::Failed.into(), &now, "")
            .await
            .unwrap();
        assert!(!written);

        assert!(log.query_bucket("1h", "1d").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_utc_event_time_is_invalid() {
        let log = SqliteEventLog::in_memory(EventLogMode::Strict).await.unwrap();
        let err = log
            .record_transition(
                &key("c/workflow-w/i"),
                State::Claimed.into(),
                "2024-01-01T00:00:00+02:00",
                "e",
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_bucket_aggregation_counts_unique_items() {
        let log = SqliteEventLog::in_memory(EventLogMode::Strict).await.unwrap();
        let now = Utc::now();
        let recent = format_timestamp(now - Duration::minutes(1));
        let earlier = format_timestamp(now - Duration::minutes(2));

        for (id, state, at) in [
            ("c/workflow-w/a", State::Failed, &recent),
            ("c/workflow-w/a", State::Failed, &earlier),
            ("c/workflow-w/b", State::Failed, &recent),
            ("c/workflow-w/a", State::Completed, &recent),
        ] {
            assert!(log
                .record_transition(&key(id), state.into(), at, "exec")
                .await
                .unwrap());
        }

        let rows = log.query_bucket("1d", "1h").await.unwrap();
        let total: u64 = rows.iter().map(|r| r.count).sum();
        assert_eq!(total, 4);

        let failed: Vec<_> = rows
            .iter()
            .filter(|r| r.state == EventState::Failed)
            .collect();
        assert_eq!(failed.iter().map(|r| r.count).sum::<u64>(), 3);
        assert!(failed.iter().all(|r| r.unique_count <= 2));

        let hour = log.query_hour(1, 0).await.unwrap();
        assert_eq!(hour.len(), 2);
        let failed = hour.iter().find(|r| r.state == EventState::Failed).unwrap();
        assert_eq!(failed.unique_count, 2);
        assert_eq!(failed.count, 3);
        let completed = hour.iter().find(|r| r.state == EventState::Completed).unwrap();
        assert_eq!(completed.unique_count, 1);
        assert_eq!(completed.count, 1);
        assert!(hour.iter().all(|r| r.bucket == hour[0].bucket));
    }

    #[tokio::test]
    async fn test_old_events_fall_outside_window() {
        let log = SqliteEventLog::in_memory(EventLogMode::Strict).await.unwrap();
        let old = format_timestamp(Utc::now() - Duration::days(3));
        log.record_transition(&key("c/workflow-w/a"), State::Claimed.into(), &old, "e")
            .await
            .unwrap();

        assert!(log.query_bucket("1h", "1d").await.unwrap().is_empty());
        assert_eq!(log.query_bucket("1d", "7d").await.unwrap().len(), 1);
        assert!(log.query_hour(2, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_rejects_bad_durations() {
        let log = SqliteEventLog::in_memory(EventLogMode::Lenient).await.unwrap();
        assert!(log.query_bucket("1w", "1d").await.unwrap_err().is_validation());
        assert!(log.query_bucket("0h", "1d").await.unwrap_err().is_validation());
        assert!(log.query_hour(1, 2).await.unwrap_err().is_validation());
    }
}
