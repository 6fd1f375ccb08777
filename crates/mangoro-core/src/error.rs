//! Error types for Mangoro.
//!
//! Registration errors are fatal at startup. Everything else that can go wrong
//! while serving a request is turned into an `Error` reply by the dispatcher,
//! so these variants double as the reply text sent to clients.

use thiserror::Error;

/// Main error type for the Mangoro core.
#[derive(Debug, Error)]
pub enum MangoroError {
    // Registration errors
    #[error("function {name} already registered")]
    DuplicateName { name: String },

    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("invalid type: {message}")]
    InvalidType { message: String },

    // Message framing errors
    #[error("message truncated: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    #[error("{field} length {declared} overruns buffer ({remaining} bytes remaining)")]
    FieldOverrun {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    // Dispatch errors
    #[error("function not found: {name}")]
    UnknownFunction { name: String },

    #[error("unknown message type: {0}")]
    UnknownMessageKind(u8),

    // Codec errors
    #[error("decode failed: {message}")]
    DecodeFailed { message: String },

    #[error("encode failed: {message}")]
    EncodeFailed { message: String },

    #[error("schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    // Handler errors
    #[error("{0}")]
    Handler(String),

    // Transport errors
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("transport closed")]
    TransportClosed,

    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("remote error from {func_name:?}: {message}")]
    Remote { func_name: String, message: String },

    // Ambient errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{resource} lock poisoned")]
    LockPoisoned { resource: &'static str },

    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for Mangoro operations.
pub type Result<T> = std::result::Result<T, MangoroError>;

/// Taxonomy row an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Registration,
    Framing,
    Dispatch,
    Codec,
    Handler,
    Transport,
    Internal,
}

impl From<std::io::Error> for MangoroError {
    fn from(err: std::io::Error) -> Self {
        MangoroError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MangoroError {
    fn from(err: serde_json::Error) -> Self {
        MangoroError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MangoroError {
    /// Which part of the taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MangoroError::DuplicateName { .. }
            | MangoroError::InvalidSchema { .. }
            | MangoroError::InvalidType { .. } => ErrorCategory::Registration,

            MangoroError::Truncated { .. }
            | MangoroError::FieldOverrun { .. }
            | MangoroError::InvalidUtf8 { .. } => ErrorCategory::Framing,

            MangoroError::UnknownFunction { .. } | MangoroError::UnknownMessageKind(_) => {
                ErrorCategory::Dispatch
            }

            MangoroError::DecodeFailed { .. }
            | MangoroError::EncodeFailed { .. }
            | MangoroError::SchemaMismatch { .. } => ErrorCategory::Codec,

            MangoroError::Handler(_) => ErrorCategory::Handler,

            MangoroError::Transport { .. }
            | MangoroError::TransportClosed
            | MangoroError::FrameTooLarge { .. }
            | MangoroError::InvalidEndpoint { .. }
            | MangoroError::Remote { .. } => ErrorCategory::Transport,

            _ => ErrorCategory::Internal,
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        MangoroError::Transport {
            message: message.into(),
        }
    }
}
