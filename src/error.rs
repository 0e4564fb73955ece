//! Custom error types for the component model.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it gives one consistent taxonomy for failures of
//! attributes, components, actions and the remote access layer.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`** / **`ReadOnly`**: a value assignment was rejected. The attribute keeps
//!   its previous value.
//! - **`InvalidMetadataKey`**: a metadata key outside the recognized vocabulary.
//! - **`Configuration`**: malformed composition or configuration that parsed correctly but is
//!   logically wrong (zero dependencies, duplicate names, a resource bound twice...).
//! - **`ComponentTerminated`**: the component was terminated; attribute and action calls fail.
//! - **`RemoteCommunication`**: timeout or disconnect on the remote channel.
//! - **`ActionFailed`**: an action body returned an error or panicked. The underlying error is
//!   kept as the `source`.
//! - **`Cancelled`**: surfaced only to a caller waiting on a cancelled action.
//!
//! `DaqError` is `Clone` and serializable: a stored action outcome can be handed to every
//! waiter, and the backend ships errors over the wire so that a proxy re-raises exactly the
//! variant produced by the real component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Invalid value for '{attribute}': {reason}")]
    Validation { attribute: String, reason: String },

    #[error("Attribute '{attribute}' is read-only")]
    ReadOnly { attribute: String },

    #[error("Invalid metadata key '{0}'")]
    InvalidMetadataKey(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Component '{0}' has been terminated")]
    ComponentTerminated(String),

    #[error("Remote communication error: {0}")]
    RemoteCommunication(String),

    #[error("Action '{action}' failed: {source}")]
    ActionFailed {
        action: String,
        #[source]
        source: Box<DaqError>,
    },

    #[error("Action '{0}' was cancelled")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unknown component '{0}'")]
    UnknownComponent(String),

    #[error("Component '{component}' has no attribute '{attribute}'")]
    UnknownAttribute { component: String, attribute: String },

    #[error("Component '{component}' has no action '{action}'")]
    UnknownAction { component: String, action: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Generic failure reported by driver code.
    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Shorthand for a [`DaqError::Validation`].
    pub fn validation(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an action body error. Errors that already are `ActionFailed` are kept as-is.
    pub fn action_failed(action: impl Into<String>, source: DaqError) -> Self {
        match source {
            already @ DaqError::ActionFailed { .. } => already,
            other => Self::ActionFailed {
                action: action.into(),
                source: Box::new(other),
            },
        }
    }
}

impl From<std::io::Error> for DaqError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::validation("exposureTime", "Value 50.0 out of range [0.001, 10.0]");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'exposureTime': Value 50.0 out of range [0.001, 10.0]"
        );
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Hardware("camera timeout".into()),
            DaqError::ComponentTerminated("stage".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }

    #[test]
    fn test_action_failed_is_not_double_wrapped() {
        let inner = DaqError::Hardware("motor stalled".into());
        let once = DaqError::action_failed("move_abs", inner.clone());
        let twice = DaqError::action_failed("move_abs", once.clone());
        assert_eq!(once, twice);

        match once {
            DaqError::ActionFailed { source, .. } => assert_eq!(*source, inner),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_survives_the_wire() {
        let err = DaqError::ReadOnly {
            attribute: "position".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"read_only\""));
        let back: DaqError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
