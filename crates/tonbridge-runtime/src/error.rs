//! Error types for tonbridge-runtime.
//!
//! One variant per failure class: path resolution, marshalling, guest
//! runtime errors, native I/O, and configuration mistakes. Every boundary
//! recovers into one of these; none of them may cross as a panic.

use thiserror::Error;
use tonbridge_core::GuestError;

use crate::marshal::MarshalError;

/// Errors surfaced to native callers of the bridge.
#[derive(Error, Debug)]
pub enum HostError {
    /// A dotted guest function path was empty.
    #[error("empty guest function path")]
    EmptyPath,

    /// A dotted guest function path did not resolve to a value.
    #[error("no value at '{path}': missing segment '{segment}'")]
    PathResolution { path: String, segment: String },

    /// A dotted guest function path resolved to a non-callable value.
    #[error("'{path}' resolved to {found}, which is not callable")]
    NotCallable { path: String, found: &'static str },

    /// Value conversion across the boundary failed.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// Guest code threw or rejected; carries the sanitized message only.
    #[error("guest error: {message}")]
    Guest { message: String },

    /// HTTP transfer failure.
    #[error("http error: {0}")]
    Http(String),

    /// The operation was cancelled through its abort signal.
    #[error("request aborted")]
    Aborted,

    /// Secret storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cryptographic primitive failure or invalid input.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Programmer/configuration mistake (for example dispatching with no
    /// live listeners). Investigate rather than retry.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation exceeded its deadline.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Internal(String),
}

impl HostError {
    pub fn guest(message: impl Into<String>) -> Self {
        Self::Guest {
            message: message.into(),
        }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<GuestError> for HostError {
    fn from(err: GuestError) -> Self {
        Self::Guest {
            message: err.message,
        }
    }
}

/// Result type alias for host operations.
pub type HostResult<T> = Result<T, HostError>;
