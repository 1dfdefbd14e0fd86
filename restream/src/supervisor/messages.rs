//! Messages handled by the supervisor actor.

use tokio::sync::oneshot;

use crate::Result;
use crate::broadcast::{StatusSnapshot, Subscription};
use crate::config::{ConfigUpdate, StreamConfig};

/// Requests from callers. Each carries its own reply channel.
pub(crate) enum Command {
    SetConfig {
        update: ConfigUpdate,
        reply: oneshot::Sender<Result<String>>,
    },
    Start {
        reply: oneshot::Sender<Result<String>>,
    },
    Stop {
        reply: oneshot::Sender<Result<String>>,
    },
    GetStatus {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::SetConfig { .. } => "set_config",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::GetStatus { .. } => "get_status",
            Self::Subscribe { .. } => "subscribe",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// Result of a background input probe.
pub(crate) struct ProbeOutcome {
    pub attempt: u64,
    pub config: StreamConfig,
    pub result: Result<()>,
}
