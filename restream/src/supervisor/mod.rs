//! Stream process supervisor.
//!
//! The supervisor runs as an actor task that owns the [`StreamState`], the
//! stream configuration and the encoder process. Callers talk to it through a
//! cloneable [`SupervisorHandle`]; observers receive every state change
//! through a [`Subscription`](crate::broadcast::Subscription).
//!
//! ```text
//!   Idle ──start──► Starting ──probe ok, encoder up──► Live
//!    ▲                │  │                              │
//!    │   probe failed │  │ stop                    stop │
//!    ├────────────────┘  ▼                              ▼
//!    └──────────────── Stopping ◄───────────────────────┘
//! ```
//!
//! Encoder failures and unexpected exits return `Starting`/`Live` to `Idle`.

mod actor;
mod handle;
mod messages;
mod state;

pub use handle::{EncoderHealth, HealthReport, InputHealth, SupervisorHandle};
pub use state::StreamState;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broadcast::StatusBroadcaster;
use crate::config::{DEFAULT_INPUT_URL, DEFAULT_PROBE_TIMEOUT, DEFAULT_STOP_GRACE, ServiceConfig};
use crate::probe::{FfmpegProbe, InputProbe};
use actor::SupervisorActor;

/// Default command mailbox capacity.
const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Settings the supervisor needs from the service configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ffmpeg_path: String,
    pub input_url: String,
    pub probe_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            input_url: DEFAULT_INPUT_URL.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl From<&ServiceConfig> for SupervisorSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            input_url: config.input_url.clone(),
            probe_timeout: config.probe_timeout,
            stop_grace: config.stop_grace,
        }
    }
}

/// Entry point for starting the supervisor.
pub struct Supervisor;

impl Supervisor {
    /// Spawn the supervisor with an ffmpeg-backed input probe.
    pub fn spawn(settings: SupervisorSettings) -> SupervisorHandle {
        let probe = Arc::new(FfmpegProbe::new(settings.ffmpeg_path.clone()));
        Self::spawn_with_probe(settings, probe)
    }

    /// Spawn the supervisor with a custom input probe.
    pub fn spawn_with_probe(
        settings: SupervisorSettings,
        probe: Arc<dyn InputProbe>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(DEFAULT_MAILBOX_CAPACITY);
        let broadcaster = StatusBroadcaster::new();

        let handle = SupervisorHandle::new(
            tx,
            probe.clone(),
            broadcaster.clone(),
            settings.clone(),
        );

        let actor = SupervisorActor::new(settings, probe, broadcaster, rx);
        tokio::spawn(actor.run());

        handle
    }
}
