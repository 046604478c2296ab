use thiserror::Error;

/// Errors surfaced by the presence engine.
///
/// The engine is nearly total: the only failures are malformed identifiers
/// at the façade and configuration that breaks the liveness timing rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// A viewer or item identifier was empty or blank
    #[error("invalid {field}: identifier must be non-empty")]
    InvalidIdentifier { field: &'static str },

    /// Configuration violates a timing or sizing constraint
    #[error("invalid config [{field}]: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl PresenceError {
    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PresenceError>;

#[cfg(feature = "python")]
mod py {
    use pyo3::{create_exception, exceptions::PyValueError, PyErr};

    use super::PresenceError;

    create_exception!(viewer_presence, InvalidIdentifier, PyValueError, "InvalidIdentifier");
    create_exception!(viewer_presence, InvalidConfig, PyValueError, "InvalidConfig");

    impl From<PresenceError> for PyErr {
        fn from(err: PresenceError) -> Self {
            match err {
                PresenceError::InvalidIdentifier { .. } => InvalidIdentifier::new_err(err.to_string()),
                PresenceError::InvalidConfig { .. } => InvalidConfig::new_err(err.to_string()),
            }
        }
    }
}

#[cfg(feature = "python")]
pub use py::{InvalidConfig, InvalidIdentifier};
