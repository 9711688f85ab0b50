//! Layered settings
//!
//! Sources, lowest priority first:
//! 1. built-in defaults (serde defaults below)
//! 2. an optional TOML file
//! 3. `FLOWSTATE__*` environment variables, `__` separating nested keys
//!    (e.g. `FLOWSTATE__STATE_DB__URL=sqlite:///var/lib/flowstate/state.db`)

use crate::error::Result;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "FLOWSTATE";

/// Default stream that workflow events are published to
pub const DEFAULT_EVENT_STREAM: &str = "flowstate:workflow-events";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub state_db: StateDbSettings,
    /// Absent disables the event log
    #[serde(default)]
    pub event_db: Option<EventDbSettings>,
    /// Absent disables notifications
    #[serde(default)]
    pub notifications: Option<NotificationSettings>,
    /// Error types classified as invalid input
    #[serde(default = "default_invalid_error_types")]
    pub invalid_error_types: Vec<String>,
    /// Largest `limit` accepted by read queries
    #[serde(default = "default_query_limit_cap")]
    pub query_limit_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateDbSettings {
    #[serde(default = "default_state_db_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Raw rows fetched per underlying range read
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventDbSettings {
    pub url: String,
    /// Surface event-record validation failures instead of logging them
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    pub redis_url: String,
    #[serde(default = "default_event_stream")]
    pub stream: String,
}

impl Default for StateDbSettings {
    fn default() -> Self {
        Self {
            url: default_state_db_url(),
            max_connections: default_max_connections(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_db: StateDbSettings::default(),
            event_db: None,
            notifications: None,
            invalid_error_types: default_invalid_error_types(),
            query_limit_cap: default_query_limit_cap(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load settings, reading environment overrides from `env` when given
    /// instead of the process environment
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading settings from {}", path.display());
            builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        debug!(
            state_db = %settings.state_db.url,
            event_db = settings.event_db.is_some(),
            notifications = settings.notifications.is_some(),
            "Settings loaded"
        );
        Ok(settings)
    }
}

fn default_state_db_url() -> String {
    "sqlite://flowstate.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_scan_page_size() -> usize {
    100
}

fn default_event_stream() -> String {
    DEFAULT_EVENT_STREAM.to_string()
}

fn default_invalid_error_types() -> Vec<String> {
    vec![
        "InvalidInput".to_string(),
        "stactask.exceptions.InvalidInput".to_string(),
    ]
}

fn default_query_limit_cap() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sources() {
        let settings = Settings::load_with_env(None, Some(HashMap::new())).unwrap();
        assert_eq!(settings.state_db.url, "sqlite://flowstate.db");
        assert_eq!(settings.state_db.scan_page_size, 100);
        assert!(settings.event_db.is_none());
        assert!(settings.notifications.is_none());
        assert_eq!(settings.query_limit_cap, 1000);
        assert!(settings.invalid_error_types.contains(&"InvalidInput".to_string()));
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
query_limit_cap = 50

[state_db]
url = "sqlite::memory:"
scan_page_size = 10

[event_db]
url = "sqlite://events.db"

[notifications]
redis_url = "redis://127.0.0.1/"
"#
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("FLOWSTATE__STATE_DB__SCAN_PAGE_SIZE".to_string(), "25".to_string());
        env.insert("FLOWSTATE__EVENT_DB__STRICT".to_string(), "true".to_string());

        let settings = Settings::load_with_env(Some(file.path()), Some(env)).unwrap();
        assert_eq!(settings.state_db.url, "sqlite::memory:");
        assert_eq!(settings.state_db.scan_page_size, 25);
        assert_eq!(settings.query_limit_cap, 50);

        let event_db = settings.event_db.unwrap();
        assert_eq!(event_db.url, "sqlite://events.db");
        assert!(event_db.strict);

        let notifications = settings.notifications.unwrap();
        assert_eq!(notifications.stream, DEFAULT_EVENT_STREAM);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load_with_env(
            Some(Path::new("/nonexistent/flowstate.toml")),
            Some(HashMap::new()),
        );
        assert!(result.is_err());
    }
}
