use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy surfaced at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum EaselError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("at most {max} adapters may be active at once, {requested} were requested")]
    AdapterLimitExceeded { requested: usize, max: usize },

    #[error("adapter archive not found: {0}")]
    AdapterFileMissing(String),

    #[error("skip depth {depth} leaves no layers in an encoder with {layers} layers")]
    InvalidDepth { depth: usize, layers: usize },

    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
}

/// Stable, serializable discriminant of [`EaselError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownModel,
    InvalidInput,
    AdapterLimitExceeded,
    AdapterFileMissing,
    InvalidDepth,
    RuntimeFailure,
    ResourceUnavailable,
}

impl EaselError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownModel(_) => ErrorKind::UnknownModel,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::AdapterLimitExceeded { .. } => ErrorKind::AdapterLimitExceeded,
            Self::AdapterFileMissing(_) => ErrorKind::AdapterFileMissing,
            Self::InvalidDepth { .. } => ErrorKind::InvalidDepth,
            Self::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            Self::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
        }
    }

    /// Wraps a backend error, keeping its whole context chain in the message.
    pub fn runtime(err: anyhow::Error) -> Self {
        Self::RuntimeFailure(format!("{err:#}"))
    }
}

impl From<candle_core::Error> for EaselError {
    fn from(err: candle_core::Error) -> Self {
        Self::RuntimeFailure(err.to_string())
    }
}

pub type Result<T, E = EaselError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_keeps_context_chain() {
        let err = anyhow::anyhow!("out of memory").context("failed to load flux model");
        let wrapped = EaselError::runtime(err);
        assert_eq!(wrapped.kind(), ErrorKind::RuntimeFailure);
        let msg = wrapped.to_string();
        assert!(msg.contains("failed to load flux model"));
        assert!(msg.contains("out of memory"));
    }

    #[test]
    fn limit_message_names_both_counts() {
        let err = EaselError::AdapterLimitExceeded {
            requested: 6,
            max: 5,
        };
        assert_eq!(
            err.to_string(),
            "at most 5 adapters may be active at once, 6 were requested"
        );
    }
}
