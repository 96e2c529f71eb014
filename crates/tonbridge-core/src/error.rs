//! Guest-side error type.
//!
//! A `GuestError` is what crosses the boundary when guest code throws or an
//! engine operation fails. It carries a sanitized message string only, never
//! a native backtrace.

use thiserror::Error;

use crate::value::GuestValue;

/// Rough classification of a guest error, mirroring the standard script
/// error constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestErrorKind {
    Type,
    Range,
    Reference,
    Runtime,
}

/// An error raised by or on behalf of guest code.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct GuestError {
    pub kind: GuestErrorKind,
    pub message: String,
}

impl GuestError {
    pub fn new(kind: GuestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(GuestErrorKind::Type, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(GuestErrorKind::Range, message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new(GuestErrorKind::Reference, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(GuestErrorKind::Runtime, message)
    }

    /// Build an error from a value thrown by guest code, extracting the
    /// `message` member when present.
    pub fn thrown(value: &GuestValue) -> Self {
        Self::runtime(value.error_message())
    }
}

pub type GuestResult<T> = Result<T, GuestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thrown_extracts_message_from_string() {
        let err = GuestError::thrown(&GuestValue::String("boom".into()));
        assert_eq!(err.message, "boom");
        assert_eq!(err.kind, GuestErrorKind::Runtime);
    }
}
