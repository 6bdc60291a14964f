use serde::{Deserialize, Serialize};

use crate::{EaselError, ErrorKind};

/// Result envelope returned by every orchestrator entry point.
///
/// Serializes as `{"success": true, ...data}` or
/// `{"success": false, "error": "...", "kind": "..."}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse<T> {
    Success {
        success: bool,
        #[serde(flatten)]
        data: T,
    },
    Failure {
        success: bool,
        error: String,
        kind: ErrorKind,
    },
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::Success {
            success: true,
            data,
        }
    }

    pub fn err(err: &EaselError) -> Self {
        Self::Failure {
            success: false,
            error: err.to_string(),
            kind: err.kind(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure { error, .. } => Err(error),
        }
    }
}

impl<T> From<Result<T, EaselError>> for ApiResponse<T> {
    fn from(result: Result<T, EaselError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::err(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Loaded {
        model: String,
    }

    #[test]
    fn success_is_flattened() {
        let resp = ApiResponse::ok(Loaded {
            model: "sdxl".into(),
        });
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"success": true, "model": "sdxl"})
        );
    }

    #[test]
    fn failure_carries_message_and_kind() {
        let resp: ApiResponse<Loaded> = Err(EaselError::UnknownModel("sd3".into())).into();
        assert!(!resp.is_success());
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"success": false, "error": "unknown model 'sd3'", "kind": "unknown_model"})
        );
        assert_eq!(resp.into_result().unwrap_err(), "unknown model 'sd3'");
    }
}
