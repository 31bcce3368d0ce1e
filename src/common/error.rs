use thiserror::Error;

/// Errors raised by the cluster controller.
///
/// Safety denials and already-set requests are not errors; they are carried
/// by `CheckResult` and `SetResponse`.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not master: {0}")]
    NotMaster(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error(
        "Failing to set the wanted state for a subset of nodes is not implemented: \
         node = {node}, condition = {condition}, requested = {requested}, cluster state = '{state}'"
    )]
    UnimplementedPartialFailure {
        node: String,
        condition: String,
        requested: String,
        state: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Returns true if the caller may retry, possibly against another controller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControllerError::NotMaster(_) | ControllerError::Timeout(_))
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Io(_) => "io",
            ControllerError::Json(_) => "json",
            ControllerError::NotFound(_) => "not_found",
            ControllerError::InvalidInput(_) => "invalid_input",
            ControllerError::NotMaster(_) => "not_master",
            ControllerError::Timeout(_) => "timeout",
            ControllerError::UnimplementedPartialFailure { .. } => "unimplemented_partial_failure",
            ControllerError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ControllerError::NotMaster("x".into()).is_retryable());
        assert!(ControllerError::Timeout("x".into()).is_retryable());
        assert!(!ControllerError::NotFound("x".into()).is_retryable());
        assert!(!ControllerError::InvalidInput("x".into()).is_retryable());
        let partial = ControllerError::UnimplementedPartialFailure {
            node: "storage.1".into(),
            condition: "FORCE".into(),
            requested: "user=down".into(),
            state: "version:3".into(),
        };
        assert!(!partial.is_retryable());
        assert_eq!(partial.kind(), "unimplemented_partial_failure");
    }
}
