//! Error types for the vigil-notify crate.

use thiserror::Error;
use vigil_alerts::AlertError;

/// Errors that can occur while routing and delivering notifications.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Alertmanager configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Silence failed validation.
    #[error("invalid silence: {reason}")]
    InvalidSilence {
        /// Why the silence was rejected.
        reason: String,
    },

    /// Posted alert failed validation.
    #[error("invalid alert: {reason}")]
    InvalidAlert {
        /// Why the alert was rejected.
        reason: String,
    },

    /// Silence with the given ID was not found.
    #[error("silence not found: {id}")]
    SilenceNotFound {
        /// The missing silence ID.
        id: String,
    },

    /// A named resource was not found.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Resource name.
        name: String,
    },

    /// The request conflicts with existing state.
    #[error("conflict: {reason}")]
    Conflict {
        /// What conflicted.
        reason: String,
    },

    /// An integration failed to deliver.
    #[error("{integration}: {reason}")]
    Delivery {
        /// Integration name and type.
        integration: String,
        /// Failure description.
        reason: String,
        /// Whether another attempt may succeed.
        retryable: bool,
    },

    /// Template rendering failed.
    #[error("template error: {reason}")]
    Template {
        /// The renderer's message.
        reason: String,
    },

    /// Secure settings could not be encrypted or decrypted.
    #[error("secrets error: {reason}")]
    Secret {
        /// What went wrong.
        reason: String,
    },

    /// A remote Alertmanager could not be reached or rejected a request.
    #[error("remote alertmanager {url}: {reason}")]
    Remote {
        /// Base URL of the remote.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Error from the rule side of the engine.
    #[error(transparent)]
    Alerts(#[from] AlertError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl NotifyError {
    /// Shorthand for [`NotifyError::InvalidConfig`].
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True if a delivery may succeed on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery { retryable: true, .. } | Self::Remote { .. })
    }

    /// True for errors caused by the caller's input.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::InvalidSilence { .. }
                | Self::InvalidAlert { .. }
                | Self::Template { .. }
        )
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_config() {
        let err = NotifyError::invalid_config("token or url must be specified");
        assert_eq!(
            err.to_string(),
            "invalid configuration: token or url must be specified"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn error_display_not_found() {
        let err = NotifyError::NotFound {
            kind: "mute timing",
            name: "weekends".to_string(),
        };
        assert_eq!(err.to_string(), "mute timing not found: weekends");
    }

    #[test]
    fn delivery_retryable_flag() {
        let err = NotifyError::Delivery {
            integration: "ops[webhook]".to_string(),
            reason: "status 503".to_string(),
            retryable: true,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "ops[webhook]: status 503");

        let err = NotifyError::Delivery {
            integration: "ops[webhook]".to_string(),
            reason: "status 400".to_string(),
            retryable: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = NotifyError::from(json_err);
        assert!(err.to_string().starts_with("serialization error"));
    }
}
