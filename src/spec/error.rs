//! Error types for descriptor resolution.

use thiserror::Error;

/// Errors raised while turning a raw descriptor into a [`super::ServiceSpec`].
///
/// Every variant names the offending field so the operator can fix the
/// payload without reading code.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// Raised when the payload carries neither `service` nor `name`.
    #[error("service name is required: set `service` in the payload")]
    MissingName,
    /// Raised when the service name is unsafe as a path segment or DNS label.
    #[error("invalid service name '{name}': {reason}")]
    InvalidName {
        /// Name as supplied.
        name: String,
        /// Which rule the name violates.
        reason: String,
    },
    /// Raised when an optional field carries an unusable value.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Payload field, including the rule index for location fields.
        field: String,
        /// Which rule the value violates.
        reason: String,
    },
    /// Raised when the payload itself is not a JSON object.
    #[error("malformed payload: {message}")]
    Payload {
        /// Parser message.
        message: String,
    },
    /// Raised when an environment key cannot be written to a drop-in file.
    #[error("invalid environment key '{key}' in {origin}")]
    InvalidEnvKey {
        /// Offending key.
        key: String,
        /// Which input supplied the key.
        origin: String,
    },
    /// Raised when an environment source is not a flat string mapping.
    #[error("invalid {origin}: {reason}")]
    Environment {
        /// Which input failed to parse.
        origin: String,
        /// Parser message or shape violation.
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
