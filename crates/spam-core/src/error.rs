use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpamError {
    #[error("not found: {namespace}/{id}")]
    NotFound { namespace: String, id: String },

    #[error("no eligible resource in {0}")]
    EmptySelection(String),

    #[error("remote {operation} on {kind} failed: {message}")]
    Remote {
        operation: String,
        kind: String,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cannot decode record '{key}': {reason}")]
    Deserialize { key: String, reason: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid name '{0}': must be lowercase alphanumeric with '-' or '_'")]
    InvalidName(String),

    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("administrative {0} not found in the remote system")]
    AdminMissing(String),

    #[error("operation '{operation}' is not supported for {kind}")]
    Unsupported { operation: String, kind: String },

    #[error("task cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SpamError {
    pub fn remote(
        operation: impl Into<String>,
        kind: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        SpamError::Remote {
            operation: operation.into(),
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        SpamError::Storage(e.to_string())
    }

    /// Errors scoped to a single scheduled action. Anything else must stop
    /// the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpamError::NotFound { .. }
                | SpamError::EmptySelection(_)
                | SpamError::Remote { .. }
                | SpamError::Unsupported { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_fatal() {
        assert!(!SpamError::storage("disk full").is_recoverable());
        assert!(!SpamError::AdminMissing("user 'admin'".into()).is_recoverable());
    }

    #[test]
    fn action_local_errors_are_recoverable() {
        assert!(SpamError::remote("create", "volumes", "boom").is_recoverable());
        assert!(SpamError::EmptySelection("compute/servers".into()).is_recoverable());
        assert!(SpamError::NotFound {
            namespace: "identity/users".into(),
            id: "u1".into()
        }
        .is_recoverable());
    }

    #[test]
    fn remote_error_message_names_operation_and_kind() {
        let msg = SpamError::remote("delete", "ports", "409 conflict").to_string();
        assert_eq!(msg, "remote delete on ports failed: 409 conflict");
    }
}
