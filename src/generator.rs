//! Event Generation
//!
//! `SourceProfile` is the capability record that drives one source: its
//! identity, weighted templates and source-level metadata. `EventFactory`
//! turns a profile into events and is shared by the per-source scheduler
//! and the batch worker threads.

use crate::core::{Event, Level, Metadata, SourceIdentity, Technique};
use crate::error::{Result, SimError};
use crate::template::{
    NoTechniques, Template, TechniqueLookup, merge_metadata, render, resolve_choices,
    select_template,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Everything needed to synthesize events for one configured source
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub identity: SourceIdentity,
    pub templates: Vec<Template>,
    pub metadata: Metadata,
}

impl SourceProfile {
    pub fn new(identity: SourceIdentity, templates: Vec<Template>) -> Self {
        Self {
            identity,
            templates,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Reject profiles that can never produce an event
    pub fn validate(&self) -> Result<()> {
        if self.templates.is_empty() {
            return Err(SimError::NoTemplates(self.identity.name.clone()));
        }
        if let Some(bad) = self
            .templates
            .iter()
            .find(|t| !t.probability.is_finite() || t.probability < 0.0)
        {
            return Err(SimError::InvalidConfig(format!(
                "template `{}` of source `{}` has invalid probability {}",
                bad.message, self.identity.name, bad.probability
            )));
        }
        Ok(())
    }

    /// Identity fields plus source-level metadata
    fn source_layer(&self) -> Metadata {
        let mut layer = self.identity.as_metadata();
        layer.extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        layer
    }
}

/// A rendered event waiting for its timestamp
#[derive(Debug, Clone)]
pub struct EventDraft {
    level: Level,
    source: SourceIdentity,
    message: String,
    metadata: Metadata,
    technique: Option<Technique>,
}

impl EventDraft {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stamp(self, timestamp: DateTime<Utc>) -> Event {
        Event {
            timestamp,
            level: self.level,
            source: self.source,
            message: self.message,
            metadata: self.metadata,
            technique: self.technique,
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Builds events from profiles. Holds generator-level metadata and the
/// technique lookup.
#[derive(Clone)]
pub struct EventFactory {
    metadata: Metadata,
    techniques: Arc<dyn TechniqueLookup>,
}

impl EventFactory {
    pub fn new(metadata: Metadata, techniques: Arc<dyn TechniqueLookup>) -> Self {
        Self {
            metadata,
            techniques,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Select a template and render it. `draw` yields uniform values in `[0, 1)`.
    pub fn compose<R: FnMut() -> f64>(&self, profile: &SourceProfile, draw: &mut R) -> Result<EventDraft> {
        let template = select_template(&profile.templates, draw())
            .ok_or_else(|| SimError::NoTemplates(profile.identity.name.clone()))?;

        let source_layer = profile.source_layer();
        let merged = merge_metadata([&source_layer, &template.metadata, &self.metadata]);
        let metadata = resolve_choices(merged, draw);
        let message = render(&template.message, &metadata)?;

        let technique = template
            .technique
            .clone()
            .or_else(|| self.techniques.lookup(&message));

        Ok(EventDraft {
            level: template.level,
            source: profile.identity.clone(),
            message,
            metadata,
            technique,
        })
    }
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new(Metadata::new(), Arc::new(NoTechniques))
    }
}
