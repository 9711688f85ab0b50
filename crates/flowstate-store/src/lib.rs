//! flowstate store - workflow state records and transition history
//!
//! Tracks every payload through its lifecycle:
//! CLAIMED → PROCESSING → COMPLETED/FAILED/INVALID/ABORTED
//!
//! Features:
//! - SQLite state store with a guarded `claim`
//! - Filtered, resumable range queries and capped counts
//! - Append-only event log with time-bucketed aggregates
//! - Prometheus metrics

pub mod error;
pub mod event_log;
pub mod metrics;
pub mod query;
pub mod record;
pub mod sqlite_store;
pub mod state_store;

pub use error::{Result, StoreError};
pub use event_log::{BucketCount, DisabledEventLog, EventLog, EventLogMode, EventRecord, SqliteEventLog};
pub use query::{Count, Cursor, Page, QueryFilter, SortIndex, StateSummary};
pub use record::StateRecord;
pub use sqlite_store::SqliteStateStore;
pub use state_store::StateStore;
