//! Structured event definitions for logging.
//!
//! Every event fc-core emits uses one of the stable names in
//! [`event_names`] as its tracing target, so JSONL consumers can match on
//! `event` without parsing messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Log levels for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Subsystem an event belongs to, derived from the event name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Impersonate,
    Pool,
    Quirk,
    Config,
}

impl Component {
    pub fn of_event(event: &str) -> Option<Component> {
        match event.split('.').next()? {
            "impersonate" => Some(Component::Impersonate),
            "pool" => Some(Component::Pool),
            "quirk" => Some(Component::Quirk),
            "config" => Some(Component::Config),
            _ => None,
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Impersonate => "impersonate",
            Component::Pool => "pool",
            Component::Quirk => "quirk",
            Component::Config => "config",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Impersonation scope
    pub const IMPERSONATE_BEGIN: &str = "impersonate.begin";
    pub const IMPERSONATE_ACQUIRED: &str = "impersonate.acquired";
    pub const IMPERSONATE_ROLLBACK: &str = "impersonate.rollback";
    pub const IMPERSONATE_RELEASED: &str = "impersonate.released";
    pub const IMPERSONATE_RESTORE_FAILED: &str = "impersonate.restore_failed";

    // Quirk detection
    pub const QUIRK_PROBE_STARTED: &str = "quirk.probe_started";
    pub const QUIRK_DETECTED: &str = "quirk.detected";
    pub const QUIRK_CACHE_HIT: &str = "quirk.cache_hit";
    pub const QUIRK_PROBE_FAILED: &str = "quirk.probe_failed";

    // Worker pool
    pub const POOL_WORKER_STARTED: &str = "pool.worker_started";
    pub const POOL_WORKER_STOPPED: &str = "pool.worker_stopped";

    pub const CONFIG_LOADED: &str = "config.loaded";
}

/// A structured log event for JSONL output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    pub level: Level,
    /// Event name (e.g., "impersonate.begin", "quirk.detected").
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,
    /// Worker index when emitted from a pool thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<u64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, serde_json::Value>,
}

impl LogEvent {
    pub fn new(level: Level, event: impl Into<String>, message: impl Into<String>) -> Self {
        let event = event.into();
        LogEvent {
            ts: Utc::now(),
            level,
            component: Component::of_event(&event),
            event,
            worker: None,
            message: message.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_worker(mut self, worker: u64) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Add a field to the event.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
        self
    }

    /// Serialize to a single JSON line.
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"serialization_failed","event":"{}"}}"#,
                self.event
            )
        })
    }
}
