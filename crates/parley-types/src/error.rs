//! Error hierarchy for Parley.

use thiserror::Error;

/// Top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No provider configured")]
    MissingProvider,

    #[error("Client construction failed: {0}")]
    Construction(String),

    #[error("No client bound to the streaming manager")]
    NoClient,

    #[error("A stream is already in progress")]
    StreamInProgress,
}

/// Errors produced while talking to a model backend.
///
/// `Status` is the only variant the retry policy inspects structurally; the
/// rest are classified by kind or, as a last resort, by their message text.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{provider} returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        provider: String,
        retryable: bool,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Stream parse error: {0}")]
    StreamParse(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Build a structured status error.
    pub fn status(
        status: u16,
        message: impl Into<String>,
        provider: impl Into<String>,
        retryable: bool,
    ) -> Self {
        ApiError::Status {
            status,
            message: message.into(),
            provider: provider.into(),
            retryable,
        }
    }

    /// Status code of a structured error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error came from the caller's context (cancel or deadline).
    pub fn is_context(&self) -> bool {
        matches!(self, ApiError::Cancelled | ApiError::DeadlineExceeded)
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Status { .. } => "api_status",
            ApiError::Network(_) => "network",
            ApiError::Timeout => "timeout",
            ApiError::StreamParse(_) => "stream_parse",
            ApiError::Cancelled => "cancelled",
            ApiError::DeadlineExceeded => "deadline_exceeded",
            ApiError::Other(_) => "other",
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure reported by an analytics or persistence collaborator.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
