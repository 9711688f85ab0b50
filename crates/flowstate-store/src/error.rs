use flowstate_core::State;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Payload {payload_id} already claimed (state: {})", state.map(|s| s.as_str()).unwrap_or("unknown"))]
    AlreadyClaimed {
        payload_id: String,
        state: Option<State>,
        /// Latest execution reference on the existing record
        execution: Option<String>,
    },
    #[error("Event log is disabled")]
    EventLogDisabled,
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
    #[error(transparent)]
    Core(#[from] flowstate_core::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    /// Benign claim race: the payload is already CLAIMED or PROCESSING
    pub fn is_already_claimed(&self) -> bool {
        matches!(self, StoreError::AlreadyClaimed { .. })
    }

    /// Caller mistake, never worth retrying
    pub fn is_validation(&self) -> bool {
        match self {
            StoreError::Validation(_) => true,
            StoreError::Core(e) => e.is_validation(),
            _ => false,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "database",
            StoreError::Serialization(_) => "serialization",
            StoreError::Validation(_) | StoreError::Core(_) => "validation",
            StoreError::AlreadyClaimed { .. } => "already_claimed",
            StoreError::EventLogDisabled => "disabled",
            StoreError::CorruptRecord(_) => "corrupt",
        }
    }
}
