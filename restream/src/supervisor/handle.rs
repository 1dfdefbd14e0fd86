//! Caller-side handle to the supervisor actor.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::SupervisorSettings;
use super::messages::Command;
use super::state::StreamState;
use crate::broadcast::{StatusBroadcaster, StatusSnapshot, Subscription};
use crate::config::ConfigUpdate;
use crate::encoder::detect_version;
use crate::probe::{InputProbe, ProbeFailure};
use crate::{Error, Result};

/// Encoder binary diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderHealth {
    pub path: String,
    pub available: bool,
    pub version: Option<String>,
}

/// Input source diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputHealth {
    pub address: String,
    pub available: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Read-only diagnostics, independent of the stream state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub state: StreamState,
    pub observers: usize,
    pub encoder: EncoderHealth,
    pub input: InputHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.encoder.available && self.input.available
    }
}

/// Cloneable handle for talking to the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    probe: Arc<dyn InputProbe>,
    broadcaster: StatusBroadcaster,
    settings: SupervisorSettings,
}

impl SupervisorHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        probe: Arc<dyn InputProbe>,
        broadcaster: StatusBroadcaster,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            commands,
            probe,
            broadcaster,
            settings,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::SupervisorUnavailable)?;
        rx.await.map_err(|_| Error::SupervisorUnavailable)
    }

    /// Replace the output destination (and optionally the input).
    pub async fn set_config(&self, update: ConfigUpdate) -> Result<String> {
        self.request(|reply| Command::SetConfig { update, reply })
            .await?
    }

    /// Start streaming.
    ///
    /// Resolves once the encoder is live, or with the reason it did not start.
    pub async fn start(&self) -> Result<String> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stop streaming.
    ///
    /// Resolves once the encoder is confirmed terminated.
    pub async fn stop(&self) -> Result<String> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    /// Current state and configuration.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.request(|reply| Command::GetStatus { reply }).await
    }

    /// Register an observer. The first event is a status snapshot.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    /// Number of connected observers.
    pub fn observer_count(&self) -> usize {
        self.broadcaster.observer_count()
    }

    /// Check only the encoder binary.
    pub async fn encoder_health(&self) -> EncoderHealth {
        let version = detect_version(&self.settings.ffmpeg_path).await;
        EncoderHealth {
            path: self.settings.ffmpeg_path.clone(),
            available: version.is_some(),
            version,
        }
    }

    /// Check the encoder binary and the input source.
    ///
    /// Runs outside the actor; a slow probe does not delay other requests.
    pub async fn health(&self) -> Result<HealthReport> {
        let status = self.status().await?;
        let address = status.config.input_address.clone();
        let timeout = self.settings.probe_timeout;

        let (encoder, probe) = tokio::join!(
            self.encoder_health(),
            tokio::time::timeout(timeout, self.probe.probe(&address, timeout)),
        );
        let probe = probe.unwrap_or(Err(Error::InputUnavailable(ProbeFailure::Timeout)));

        let input = match probe {
            Ok(()) => InputHealth {
                address,
                available: true,
                reason: None,
                message: None,
            },
            Err(Error::InputUnavailable(failure)) => InputHealth {
                address,
                available: false,
                reason: Some(failure.code().to_string()),
                message: Some(failure.remediation()),
            },
            // The probe tool itself could not run.
            Err(e) => InputHealth {
                address,
                available: false,
                reason: None,
                message: Some(e.to_string()),
            },
        };

        Ok(HealthReport {
            state: status.state,
            observers: self.broadcaster.observer_count(),
            encoder,
            input,
        })
    }

    /// Stop any running encoder and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
