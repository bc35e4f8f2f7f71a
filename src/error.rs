//! Error Types
//!
//! One error enum for the whole crate. Configuration problems are raised at
//! `start`/`start_replay` time; per-tick and per-batch failures are logged
//! by the emitters and never reach callers as `SimError`.

use thiserror::Error;

/// Errors produced by schedulers, worker pools and the replay engine
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid frequency {frequency} for source `{source_name}`: must be > 0")]
    InvalidFrequency { source_name: String, frequency: f64 },

    #[error("source `{0}` has no templates")]
    NoTemplates(String),

    #[error("replay speed {0} is not usable (must be > 0 with representable delays)")]
    InvalidSpeed(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("template render failed: {0}")]
    Render(String),

    #[error("nothing to replay: {skipped} record(s) could not be parsed")]
    NothingToReplay { skipped: usize },

    #[error("replay was stopped or superseded before loading finished")]
    ReplaySuperseded,

    #[error("worker pool failure: {0}")]
    PoolFailed(String),

    #[error("worker pool for `{0}` has no workers configured")]
    PoolNotConfigured(String),

    #[error("`{0}` is already running")]
    AlreadyRunning(String),

    #[error("no tokio runtime available to spawn `{0}`")]
    NoRuntime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SimError {
    /// True for errors that reject a configuration before anything runs
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SimError::InvalidFrequency { .. }
                | SimError::NoTemplates(_)
                | SimError::InvalidSpeed(_)
                | SimError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(SimError::InvalidSpeed(0.0).is_config_error());
        assert!(SimError::NoTemplates("fw".into()).is_config_error());
        assert!(!SimError::PoolFailed("boom".into()).is_config_error());
    }

    #[test]
    fn test_messages_name_the_source() {
        let err = SimError::InvalidFrequency {
            source_name: "firewall".into(),
            frequency: 0.0,
        };
        assert!(err.to_string().contains("firewall"));
    }
}
