//! Core Types for synthstream
//!
//! Minimal, unified types shared by the schedulers, the batch pool and the
//! replay engine. Types are co-located here as the single source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// String-keyed event metadata. Ordered so serialized events are stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Event
// ============================================================================

/// Severity of an event
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[serde(alias = "debug")]
    Debug,
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warn", alias = "WARNING", alias = "warning")]
    Warn,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "critical", alias = "FATAL", alias = "fatal")]
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// Parse a level name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Level::Debug),
            "INFO" => Some(Level::Info),
            "WARN" | "WARNING" => Some(Level::Warn),
            "ERROR" => Some(Level::Error),
            "CRITICAL" | "FATAL" => Some(Level::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a logical emitter (e.g. "firewall")
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    #[serde(rename = "type")]
    pub source_type: String,
    pub name: String,
    #[serde(default)]
    pub host: String,
    /// Free-form identity attributes (vendor, product, site...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl SourceIdentity {
    pub fn new(
        source_type: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            name: name.into(),
            host: host.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Identity fields exposed to message templates
    pub fn as_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("source".into(), self.name.clone().into());
        meta.insert("source_type".into(), self.source_type.clone().into());
        meta.insert("host".into(), self.host.clone().into());
        for (k, v) in &self.attributes {
            meta.insert(k.clone(), v.clone().into());
        }
        meta
    }
}

/// Security technique annotation attached to an event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Technique {
    pub id: String,
    pub name: String,
}

impl Technique {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One generated or replayed synthetic record - primary unit of the system
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub source: SourceIdentity,
    pub message: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technique: Option<Technique>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
}

impl Event {
    /// Get metadata value by key
    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn source_type(&self) -> &str {
        &self.source.source_type
    }
}
