//! Client handles built once from settings and shared by every command

use anyhow::{Context, Result};
use flowstate_core::Settings;
use flowstate_events::{Publisher, RedisStreamPublisher, StatusResolver, WorkflowEventManager};
use flowstate_store::{DisabledEventLog, EventLog, SqliteEventLog, SqliteStateStore, StateStore};
use std::sync::Arc;
use tracing::{error, info};

pub struct Clients {
    pub state_store: Arc<dyn StateStore>,
    pub event_log: Arc<dyn EventLog>,
    pub publisher: Option<Arc<dyn Publisher>>,
    pub resolver: StatusResolver,
}

impl Clients {
    /// Open the state store, then the optional event log and publisher.
    ///
    /// Only the state store is required. An event log or publisher that cannot
    /// be reached is logged and left disabled.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let state_store = SqliteStateStore::from_settings(&settings.state_db)
            .await
            .with_context(|| format!("opening state store at {}", settings.state_db.url))?
            .with_limit_cap(settings.query_limit_cap);
        info!("Initialized state store at {}", settings.state_db.url);

        let event_log: Arc<dyn EventLog> = match &settings.event_db {
            Some(event_db) => match SqliteEventLog::from_settings(event_db).await {
                Ok(log) => {
                    info!("Initialized event log at {}", event_db.url);
                    Arc::new(log)
                }
                Err(e) => {
                    error!(
                        "Failed to open event log at {}: {} - continuing without event log",
                        event_db.url, e
                    );
                    Arc::new(DisabledEventLog)
                }
            },
            None => Arc::new(DisabledEventLog),
        };

        let publisher: Option<Arc<dyn Publisher>> = match &settings.notifications {
            Some(notifications) => {
                match RedisStreamPublisher::connect(&notifications.redis_url, notifications.stream.as_str()).await {
                    Ok(publisher) => Some(Arc::new(publisher)),
                    Err(e) => {
                        error!(
                            "Failed to connect publisher to {}: {} - continuing without notifications",
                            notifications.redis_url, e
                        );
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Self {
            state_store: Arc::new(state_store),
            event_log,
            publisher,
            resolver: StatusResolver::new(settings.invalid_error_types.clone()),
        })
    }

    pub fn manager(&self) -> WorkflowEventManager {
        WorkflowEventManager::new(
            self.state_store.clone(),
            self.event_log.clone(),
            self.publisher.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstate_core::config::EventDbSettings;
    use flowstate_core::decode;

    fn settings(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.state_db.url = format!("sqlite://{}", dir.path().join("state.db").display());
        settings
    }

    #[tokio::test]
    async fn test_optional_sinks_default_to_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let clients = Clients::connect(&settings(&dir)).await.unwrap();

        assert!(!clients.event_log.is_enabled());
        assert!(clients.publisher.is_none());
    }

    #[tokio::test]
    async fn test_manager_writes_through_configured_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir);
        settings.event_db = Some(EventDbSettings {
            url: format!("sqlite://{}", dir.path().join("events.db").display()),
            strict: true,
        });

        let clients = Clients::connect(&settings).await.unwrap();
        assert!(clients.event_log.is_enabled());

        let manager = clients.manager();
        manager
            .claim_processing("c/workflow-w/i", "exec-1", None)
            .await
            .unwrap();

        let key = decode("c/workflow-w/i").unwrap();
        assert!(clients.state_store.get(&key).await.unwrap().is_some());
        let rows = clients.event_log.query_hour(1, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_state_store_is_fatal() {
        let mut settings = Settings::default();
        settings.state_db.url = "sqlite:///nonexistent-dir/state.db".to_string();
        assert!(Clients::connect(&settings).await.is_err());
    }
}
