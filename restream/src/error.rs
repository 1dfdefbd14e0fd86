//! Application-wide error types.

use thiserror::Error;

use crate::probe::ProbeFailure;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Input unavailable ({}): {}", .0.code(), .0.remediation())]
    InputUnavailable(ProbeFailure),

    #[error("Encoder binary not found: {0}")]
    EncoderMissing(String),

    #[error("Encoder failed: {0}")]
    EncoderRuntime(String),

    #[error("Stream is already running")]
    AlreadyRunning,

    #[error("No stream is currently running")]
    NotRunning,

    #[error("Stream start was cancelled by a stop request")]
    Cancelled,

    #[error("Supervisor is not running")]
    SupervisorUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn encoder_runtime(msg: impl Into<String>) -> Self {
        Self::EncoderRuntime(msg.into())
    }

    /// Stable code used by the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::InputUnavailable(_) => "INPUT_UNAVAILABLE",
            Self::EncoderMissing(_) => "ENCODER_MISSING",
            Self::EncoderRuntime(_) => "ENCODER_RUNTIME_FAILURE",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::Cancelled => "CANCELLED",
            Self::SupervisorUnavailable => "SUPERVISOR_UNAVAILABLE",
            Self::Io(_) => "IO_ERROR",
            Self::ApiError(_) => "API_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}
