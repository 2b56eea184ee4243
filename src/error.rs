use thiserror::Error;

use crate::interpreter::Handle;

/// Main error type for the Anvil interpreter
#[derive(Error, Debug, Clone)]
pub enum AnvilError {
    /// Query or apply referencing a deleted or unknown handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    /// Any call made after the channel was closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Failure captured on the worker and surfaced on synchronization
    #[error(transparent)]
    Async(Box<AsyncError>),

    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Device-related errors
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// Unbalanced scopes or profiling state misuse
    #[error("Profiling error: {0}")]
    ProfilingError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

/// A compute failure raised on the worker thread.
///
/// `operation` names the operation whose kernel actually failed. When the
/// failure reached the queried tensor through dependent operations, those
/// are listed in `propagated_through`, oldest first.
#[derive(Error, Debug, Clone)]
#[error("Async error in '{operation}': {source}")]
pub struct AsyncError {
    pub operation: String,
    pub propagated_through: Vec<String>,
    #[source]
    pub source: Box<AnvilError>,
}

impl AsyncError {
    pub fn root_cause(&self) -> &AnvilError {
        &self.source
    }
}

impl AnvilError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        AnvilError::ShapeError(message)
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        AnvilError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, AnvilError::Async(_))
    }

    /// The original failure behind an async error, or `self` otherwise
    pub fn root_cause(&self) -> &AnvilError {
        match self {
            AnvilError::Async(inner) => inner.root_cause().root_cause(),
            other => other,
        }
    }
}

impl From<AsyncError> for AnvilError {
    fn from(err: AsyncError) -> Self {
        AnvilError::Async(Box::new(err))
    }
}

impl From<std::io::Error> for AnvilError {
    fn from(err: std::io::Error) -> Self {
        AnvilError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AnvilError {
    fn from(err: serde_json::Error) -> Self {
        AnvilError::SerializationError(err.to_string())
    }
}

/// Result type for Anvil operations
pub type AnvilResult<T> = Result<T, AnvilError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidHandle,
    ChannelClosed,
    AsyncFailure,
    ShapeMismatch,
    DeviceError,
    InvalidOperation,
    ProfilingMisuse,
    ConfigInvalid,
    SerializationFailed,
    InternalError,
}

impl AnvilError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AnvilError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            AnvilError::ChannelClosed => ErrorCode::ChannelClosed,
            AnvilError::Async(_) => ErrorCode::AsyncFailure,
            AnvilError::ShapeError(_) => ErrorCode::ShapeMismatch,
            AnvilError::DeviceError(_) => ErrorCode::DeviceError,
            AnvilError::OperationError { .. } => ErrorCode::InvalidOperation,
            AnvilError::ProfilingError(_) => ErrorCode::ProfilingMisuse,
            AnvilError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            AnvilError::SerializationError(_) => ErrorCode::SerializationFailed,
            AnvilError::InternalError(_) => ErrorCode::InternalError,
            AnvilError::UnsupportedOperation(_) => ErrorCode::InvalidOperation,
            AnvilError::InvalidInput(_) => ErrorCode::InvalidOperation,
            AnvilError::IoError(_) => ErrorCode::InvalidOperation,
        }
    }

    /// Structural errors are raised on the calling thread and never involve the worker
    pub fn is_structural(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::InvalidHandle | ErrorCode::ChannelClosed
        )
    }
}
