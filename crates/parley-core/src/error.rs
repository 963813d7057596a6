use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recognition,
    Generation,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Client connection lost")]
    ConnectionLost,

    #[error("Recognition stream closed: {0}")]
    StreamClosed(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Malformed {stage} response: {message}")]
    MalformedResponse { stage: Stage, message: String },

    #[error("{stage} call timed out after {after_ms}ms")]
    Timeout { stage: Stage, after_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// The stage this error belongs to. Malformed responses and timeouts
    /// resolve to the stage that produced them.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::StreamClosed(_) => Some(Stage::Recognition),
            Self::Generation(_) => Some(Stage::Generation),
            Self::Synthesis(_) => Some(Stage::Synthesis),
            Self::MalformedResponse { stage, .. } | Self::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether the error must tear the whole session down.
    ///
    /// Generation and synthesis failures only abandon the current cycle.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::ConnectionLost | Self::StreamClosed(_) => true,
            other => other.stage() == Some(Stage::Recognition),
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::ConnectionLost => "connection_lost",
            Self::StreamClosed(_) => "stream_closed",
            Self::Generation(_) => "generation",
            Self::Synthesis(_) => "synthesis",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }

    pub fn malformed(stage: Stage, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            stage,
            message: message.into(),
        }
    }

    pub fn timeout(stage: Stage, after: std::time::Duration) -> Self {
        Self::Timeout {
            stage,
            after_ms: after.as_millis() as u64,
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_attribution() {
        assert_eq!(
            ParleyError::malformed(Stage::Generation, "no choices").stage(),
            Some(Stage::Generation)
        );
        assert_eq!(
            ParleyError::Timeout {
                stage: Stage::Synthesis,
                after_ms: 100
            }
            .stage(),
            Some(Stage::Synthesis)
        );
        assert_eq!(ParleyError::ConnectionLost.stage(), None);
    }

    #[test]
    fn test_session_fatal_classification() {
        assert!(ParleyError::ConnectionLost.is_session_fatal());
        assert!(ParleyError::StreamClosed("eof".into()).is_session_fatal());
        assert!(ParleyError::malformed(Stage::Recognition, "bad frame").is_session_fatal());
        assert!(!ParleyError::Generation("500".into()).is_session_fatal());
        assert!(!ParleyError::Synthesis("503".into()).is_session_fatal());
        assert!(
            !ParleyError::Timeout {
                stage: Stage::Generation,
                after_ms: 20_000
            }
            .is_session_fatal()
        );
    }

    #[test]
    fn test_display_includes_stage() {
        let err = ParleyError::Timeout {
            stage: Stage::Synthesis,
            after_ms: 1500,
        };
        assert_eq!(err.to_string(), "synthesis call timed out after 1500ms");
        assert_eq!(err.kind(), "timeout");
    }
}
