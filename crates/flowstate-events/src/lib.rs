//! flowstate events - the workflow state write path
//!
//! Turns workflow engine status changes and dispatcher decisions into:
//! - authoritative state record updates
//! - event log entries for aggregate reporting
//! - notifications for downstream subscribers

pub mod batch_log;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod status;
pub mod workflow_event;

pub use batch_log::{diagnose, extract_log_ref, parse_error_line, BatchLogRef, TaskFailure, TaskLogSource};
pub use error::{EventError, LogExtractionError, Result};
pub use manager::{Announcement, WorkflowEventManager};
pub use publisher::{BroadcastPublisher, Publisher, RedisStreamPublisher};
pub use status::{ExecutionError, ExecutionHistory, Resolution, StatusChange, StatusResolver};
pub use workflow_event::{NotificationMessage, WorkflowEvent, RESERVED_FIELDS};
