//! Stream state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// Nothing running.
    #[default]
    Idle,
    /// Probing the input or waiting for the encoder to come up.
    Starting,
    /// The encoder is publishing.
    Live,
    /// Termination requested, waiting for the encoder to exit.
    Stopping,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Live => "LIVE",
            Self::Stopping => "STOPPING",
        }
    }

    /// Whether the encoder is publishing.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Whether a start request must be rejected.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: StreamState) -> bool {
        use StreamState::*;

        matches!(
            (self, target),
            (Idle, Starting)
                | (Starting, Idle | Live | Stopping)
                | (Live, Idle | Stopping)
                | (Stopping, Idle)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: StreamState) -> Result<StreamState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::Other(format!(
                "Invalid state transition: cannot transition from {} to {}",
                self, target
            )))
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
