//! Generator Configuration
//!
//! JSON configuration for a whole generation run: generator-level
//! metadata, technique keyword rules and one entry per source. A source
//! with a `batch` section runs on a worker pool instead of the per-source
//! scheduler.

use crate::core::{Metadata, SourceIdentity};
use crate::error::{Result, SimError};
use crate::forward::ForwarderConfig;
use crate::generator::SourceProfile;
use crate::pool::PoolConfig;
use crate::scheduler::ScheduleConfig;
use crate::template::{Template, TechniqueRule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GeneratorConfig {
    /// Applied to every event; wins over source and template metadata
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub techniques: Vec<TechniqueRule>,
    pub sources: Vec<SourceConfig>,
    /// Forward over HTTP instead of writing to stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwarderConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Events per minute
    pub frequency: f64,
    pub templates: Vec<Template>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<PoolConfig>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn identity(&self) -> SourceIdentity {
        let mut identity = SourceIdentity::new(&self.source_type, &self.name, &self.host);
        identity.attributes = self.attributes.clone();
        identity
    }

    pub fn profile(&self) -> SourceProfile {
        SourceProfile::new(self.identity(), self.templates.clone()).with_metadata(self.metadata.clone())
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            enabled: self.enabled,
            frequency: self.frequency,
            seed: self.seed,
        }
    }

    pub fn is_batch(&self) -> bool {
        self.batch.is_some()
    }
}

impl GeneratorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: GeneratorConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Fail fast on anything that would only break at the first tick
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(SimError::InvalidConfig("source name must not be empty".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(SimError::InvalidConfig(format!(
                    "duplicate source name `{}`",
                    source.name
                )));
            }
            if !source.enabled {
                continue;
            }
            source.schedule().tick_interval(&source.name)?;
            source.profile().validate()?;
            if let Some(batch) = &source.batch {
                batch.validate()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Level;

    const SAMPLE: &str = r#"{
        "metadata": {"env": "lab"},
        "techniques": [{"keyword": "failed password", "id": "T1110", "name": "Brute Force"}],
        "sources": [
            {
                "type": "auth",
                "name": "sshd",
                "host": "bastion-1",
                "frequency": 20,
                "templates": [
                    {"level": "WARN", "message": "Failed password for {user}", "probability": 0.7,
                     "metadata": {"user": ["root", "admin"]}},
                    {"level": "info", "message": "Accepted publickey for deploy", "probability": 0.3}
                ]
            },
            {
                "type": "netflow",
                "name": "core-router",
                "frequency": 600000,
                "templates": [{"level": "DEBUG", "message": "flow", "probability": 1.0}],
                "batch": {"workers": 2}
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = GeneratorConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.techniques[0].id, "T1110");

        let sshd = &config.sources[0];
        assert!(sshd.enabled);
        assert!(!sshd.is_batch());
        assert_eq!(sshd.templates[1].level, Level::Info);
        assert_eq!(sshd.identity().host, "bastion-1");

        let batch = config.sources[1].batch.as_ref().unwrap();
        assert_eq!(batch.workers, 2);
        assert_eq!(batch.high_water_mark, 10_000);
        assert_eq!(batch.flush_batch_size, 1_000);
    }

    #[test]
    fn test_rejects_bad_sources() {
        let zero = SAMPLE.replace("\"frequency\": 20", "\"frequency\": 0");
        assert!(matches!(
            GeneratorConfig::from_json_str(&zero),
            Err(SimError::InvalidFrequency { .. })
        ));

        let dup = SAMPLE.replace("core-router", "sshd");
        assert!(matches!(
            GeneratorConfig::from_json_str(&dup),
            Err(SimError::InvalidConfig(_))
        ));

        assert!(matches!(
            GeneratorConfig::from_json_str("{\"sources\": 3}"),
            Err(SimError::Json(_))
        ));
    }

    #[test]
    fn test_disabled_sources_skip_validation() {
        let disabled = SAMPLE.replace(
            "\"frequency\": 20",
            "\"frequency\": 0, \"enabled\": false",
        );
        assert!(GeneratorConfig::from_json_str(&disabled).is_ok());
    }
}
