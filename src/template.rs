//! Message Templates
//!
//! Weighted message patterns, the cumulative-probability selector, `{key}`
//! placeholder rendering and technique lookup.

use crate::core::{Level, Metadata, Technique};
use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};

/// A weighted message pattern used to synthesize an event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Template {
    pub level: Level,
    /// Message pattern with `{key}` placeholders
    pub message: String,
    /// Selection probability; a source's templates should sum to 1.0
    pub probability: f64,
    #[serde(default)]
    pub metadata: Metadata,
    /// Explicit technique, wins over text lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technique: Option<Technique>,
}

impl Template {
    pub fn new(level: Level, message: impl Into<String>, probability: f64) -> Self {
        Self {
            level,
            message: message.into(),
            probability,
            metadata: Metadata::new(),
            technique: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_technique(mut self, technique: Technique) -> Self {
        self.technique = Some(technique);
        self
    }
}

/// Pick a template with a uniform draw in `[0, 1)`.
///
/// Walks the running probability sum and returns the first template whose
/// cumulative weight exceeds the draw. When rounding (or weights that sum
/// below 1.0) leaves no match, the first template wins.
pub fn select_template(templates: &[Template], draw: f64) -> Option<&Template> {
    let first = templates.first()?;
    let mut cumulative = 0.0;
    for template in templates {
        cumulative += template.probability;
        if draw < cumulative {
            return Some(template);
        }
    }
    Some(first)
}

/// Merge metadata layers; later layers override earlier ones on key collision
pub fn merge_metadata<'a>(layers: impl IntoIterator<Item = &'a Metadata>) -> Metadata {
    let mut merged = Metadata::new();
    for layer in layers {
        for (k, v) in layer {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Collapse array-valued metadata to one element chosen by `draw`.
///
/// Lets a config list candidate values (`"user": ["alice", "bob"]`) so each
/// event carries a different concrete value.
pub fn resolve_choices<R: FnMut() -> f64>(metadata: Metadata, draw: &mut R) -> Metadata {
    metadata
        .into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::Array(mut options) if !options.is_empty() => {
                let idx = ((draw() * options.len() as f64) as usize).min(options.len() - 1);
                (k, options.swap_remove(idx))
            }
            other => (k, other),
        })
        .collect()
}

fn placeholder_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute `{key}` placeholders from `metadata`.
///
/// Unknown keys are left verbatim so a missing field is visible in the
/// output. `{{` and `}}` escape literal braces. An unterminated `{` is an
/// error.
pub fn render(pattern: &str, metadata: &Metadata) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut rest = pattern;

    while let Some(open) = rest.find(['{', '}']) {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        let close = tail
            .find('}')
            .ok_or_else(|| SimError::Render(format!("unterminated placeholder in `{pattern}`")))?;
        let key = &tail[1..close];
        match metadata.get(key) {
            Some(value) => out.push_str(&placeholder_text(value)),
            None => out.push_str(&tail[..=close]),
        }
        rest = &tail[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

// ============================================================================
// Technique Lookup
// ============================================================================

/// Best-effort technique lookup from rendered message text.
///
/// The lookup tables themselves live outside this crate; implementors only
/// need to answer "which technique does this message suggest, if any".
pub trait TechniqueLookup: Send + Sync {
    fn lookup(&self, message: &str) -> Option<Technique>;
}

/// Lookup that never matches
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTechniques;

impl TechniqueLookup for NoTechniques {
    fn lookup(&self, _message: &str) -> Option<Technique> {
        None
    }
}

/// Keyword rule for `KeywordTechniques`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TechniqueRule {
    pub keyword: String,
    pub id: String,
    pub name: String,
}

/// Case-insensitive substring match; first matching rule wins
#[derive(Debug, Default, Clone)]
pub struct KeywordTechniques {
    rules: Vec<(String, Technique)>,
}

impl KeywordTechniques {
    pub fn new(rules: impl IntoIterator<Item = TechniqueRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|r| (r.keyword.to_lowercase(), Technique::new(r.id, r.name)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl TechniqueLookup for KeywordTechniques {
    fn lookup(&self, message: &str) -> Option<Technique> {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|(keyword, _)| lowered.contains(keyword.as_str()))
            .map(|(_, technique)| technique.clone())
    }
}
