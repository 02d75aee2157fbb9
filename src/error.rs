//! Error taxonomy for the training engine
//!
//! Configuration and resource errors abort a run before any device work.
//! Encoding and execution errors are recovered one batch at a time.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by graph construction, sampling, and command execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed layer graph, shape mismatch, invalid batch size, empty layer list.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The compute backend could not be brought up.
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(String),

    /// A batch could not be turned into a submittable command unit.
    #[error("graph encoding failed: {0}")]
    GraphEncoding(String),

    /// Reported through a command unit's completion status.
    #[error("device execution failed: {0}")]
    DeviceExecution(String),

    /// Label or record index outside the dataset bounds.
    #[error("data bounds violated: {0}")]
    DataBounds(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl EngineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    /// Whether the error aborts the whole run rather than a single batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_) | EngineError::ResourceAcquisition(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::config("empty").is_fatal());
        assert!(EngineError::ResourceAcquisition("no queue".into()).is_fatal());
        assert!(!EngineError::GraphEncoding("label".into()).is_fatal());
        assert!(!EngineError::DeviceExecution("fault".into()).is_fatal());
        assert!(!EngineError::DataBounds("index".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_message() {
        let err = EngineError::config("batch size must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error: batch size must be positive"
        );
    }
}
