//! Notification events pushed to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StreamConfig;
use crate::supervisor::StreamState;

/// Full view of the relay at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: StreamState,
    pub is_streaming: bool,
    pub config: StreamConfig,
    /// Reason of the last failed start or encoder crash.
    pub last_error: Option<String>,
    /// When the current encoder was spawned.
    pub started_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn new(state: StreamState, config: StreamConfig) -> Self {
        Self {
            state,
            is_streaming: state.is_streaming(),
            config,
            last_error: None,
            started_at: None,
        }
    }
}

/// Events delivered to every observer.
///
/// Every variant carries the status after the change, so any single event is
/// enough for an observer to resynchronise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum StreamEvent {
    ConfigUpdated {
        message: String,
        status: StatusSnapshot,
    },
    StreamStarted {
        message: String,
        status: StatusSnapshot,
    },
    StreamStopped {
        message: String,
        status: StatusSnapshot,
    },
    StreamError {
        message: String,
        status: StatusSnapshot,
    },
    StreamStatus(StatusSnapshot),
}

impl StreamEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigUpdated { .. } => "configUpdated",
            Self::StreamStarted { .. } => "streamStarted",
            Self::StreamStopped { .. } => "streamStopped",
            Self::StreamError { .. } => "streamError",
            Self::StreamStatus(_) => "streamStatus",
        }
    }

    pub fn status(&self) -> &StatusSnapshot {
        match self {
            Self::ConfigUpdated { status, .. }
            | Self::StreamStarted { status, .. }
            | Self::StreamStopped { status, .. }
            | Self::StreamError { status, .. } => status,
            Self::StreamStatus(status) => status,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::ConfigUpdated { message, .. }
            | Self::StreamStarted { message, .. }
            | Self::StreamStopped { message, .. }
            | Self::StreamError { message, .. } => Some(message),
            Self::StreamStatus(_) => None,
        }
    }
}
