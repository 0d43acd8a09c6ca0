//! Error types for the vigil-alerts crate.

use thiserror::Error;

/// Errors that can occur while managing, scheduling or evaluating alert rules.
#[derive(Debug, Error)]
pub enum AlertError {
    /// Invalid alert rule or rule group.
    #[error("invalid alert rule: {reason}")]
    InvalidRule {
        /// The reason the rule is invalid.
        reason: String,
    },

    /// A write collided with a concurrent change.
    #[error("conflict: {reason}")]
    Conflict {
        /// What collided.
        reason: String,
    },

    /// Alert rule with the given UID was not found.
    #[error("rule not found: {uid}")]
    RuleNotFound {
        /// The rule UID that was not found.
        uid: String,
    },

    /// Rule group was not found.
    #[error("rule group not found: {namespace}/{group}")]
    GroupNotFound {
        /// Folder UID of the group.
        namespace: String,
        /// Group name.
        group: String,
    },

    /// The query executor failed.
    #[error("query execution failed: {reason}")]
    Execution {
        /// The reason the execution failed.
        reason: String,
    },

    /// Template could not be parsed or rendered.
    #[error("template error: {reason}")]
    Template {
        /// The reason the template failed.
        reason: String,
    },

    /// Invalid label matcher.
    #[error("invalid matcher: {reason}")]
    InvalidMatcher {
        /// The reason the matcher is invalid.
        reason: String,
    },

    /// Invalid duration specification.
    #[error("invalid duration: {reason}")]
    InvalidDuration {
        /// The reason the duration is invalid.
        reason: String,
    },

    /// State or rule storage failed.
    #[error("store error: {reason}")]
    Store {
        /// The reason the store operation failed.
        reason: String,
    },

    /// Cluster membership medium failed.
    #[error("membership error: {reason}")]
    Membership {
        /// The reason the membership operation failed.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for AlertError {
    fn from(err: std::io::Error) -> Self {
        Self::Store {
            reason: err.to_string(),
        }
    }
}

/// Result type for alert operations.
pub type Result<T> = std::result::Result<T, AlertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_rule() {
        let err = AlertError::InvalidRule {
            reason: "empty title".to_string(),
        };
        assert_eq!(err.to_string(), "invalid alert rule: empty title");
    }

    #[test]
    fn error_display_rule_not_found() {
        let err = AlertError::RuleNotFound {
            uid: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "rule not found: abc");
    }

    #[test]
    fn error_display_group_not_found() {
        let err = AlertError::GroupNotFound {
            namespace: "infra".to_string(),
            group: "cpu".to_string(),
        };
        assert_eq!(err.to_string(), "rule group not found: infra/cpu");
    }

    #[test]
    fn error_display_conflict() {
        let err = AlertError::Conflict {
            reason: "version 3 is stale".to_string(),
        };
        assert_eq!(err.to_string(), "conflict: version 3 is stale");
    }

    #[test]
    fn error_display_execution() {
        let err = AlertError::Execution {
            reason: "datasource unreachable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "query execution failed: datasource unreachable"
        );
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let alert_err: AlertError = json_err.unwrap_err().into();
        assert!(matches!(alert_err, AlertError::SerializationError(_)));
    }

    #[test]
    fn error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AlertError = io.into();
        assert!(matches!(err, AlertError::Store { .. }));
    }
}
