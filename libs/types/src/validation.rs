//! Tagged decode result used at service boundaries

use crate::FieldError;

/// Outcome of validating an inbound message.
///
/// Invalid input is an ordinary branch for a consumer, not an error to
/// propagate, so it is carried as a value with a human-readable reason.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Valid(T),
    Invalid {
        reason: String,
        /// Field that failed, when the failure is attributable to one
        field: Option<&'static str>,
    },
}

impl<T> Validation<T> {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Validation::Invalid {
            reason: reason.into(),
            field: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn valid(self) -> Option<T> {
        match self {
            Validation::Valid(value) => Some(value),
            Validation::Invalid { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Validation::Valid(_) => None,
            Validation::Invalid { reason, .. } => Some(reason),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Validation<U> {
        match self {
            Validation::Valid(value) => Validation::Valid(f(value)),
            Validation::Invalid { reason, field } => Validation::Invalid { reason, field },
        }
    }

    /// Chain a further check onto a valid value
    pub fn and_then<U, F: FnOnce(T) -> Validation<U>>(self, f: F) -> Validation<U> {
        match self {
            Validation::Valid(value) => f(value),
            Validation::Invalid { reason, field } => Validation::Invalid { reason, field },
        }
    }
}

impl<T> From<Result<T, FieldError>> for Validation<T> {
    fn from(result: Result<T, FieldError>) -> Self {
        match result {
            Ok(value) => Validation::Valid(value),
            Err(error) => Validation::Invalid {
                reason: error.to_string(),
                field: Some(error.field()),
            },
        }
    }
}
