//! Field-level decode errors for allow-listed message schemas

use thiserror::Error;

/// Why a single field of an inbound message could not be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// Required field absent or empty
    #[error("missing required field '{field}'")]
    Missing { field: &'static str },

    /// Field present but not parseable as its declared type
    #[error("field '{field}' is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },

    /// Amount or percentage field carrying a negative value
    #[error("field '{field}' must be non-negative, got '{value}'")]
    Negative { field: &'static str, value: String },
}

impl FieldError {
    /// Name of the offending field
    pub fn field(&self) -> &'static str {
        match self {
            FieldError::Missing { field }
            | FieldError::Malformed { field, .. }
            | FieldError::Negative { field, .. } => field,
        }
    }

    pub fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        FieldError::Malformed {
            field,
            reason: reason.into(),
        }
    }
}
