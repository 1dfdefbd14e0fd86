//! Supervisor actor.
//!
//! A single task owns the state, the configuration and the process
//! controller. Caller commands, probe results and encoder lifecycle events
//! all arrive on channels drained by this task, so every transition is
//! applied one at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SupervisorSettings;
use super::messages::{Command, ProbeOutcome};
use super::state::StreamState;
use crate::broadcast::{StatusBroadcaster, StatusSnapshot, StreamEvent};
use crate::config::{ConfigStore, ConfigUpdate, StreamConfig};
use crate::encoder::{EncoderEvent, LifecycleEvent, ProcessController};
use crate::probe::{InputProbe, ProbeFailure};
use crate::{Error, Result};

/// Extra time allowed on shutdown beyond the stop grace period.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

const MSG_CONFIG_SAVED: &str = "Output configuration saved";
const MSG_STARTED: &str = "Stream started successfully";
const MSG_STOPPED: &str = "Stream stopped successfully";
const MSG_START_CANCELLED: &str = "Stream start cancelled";

type Reply = oneshot::Sender<Result<String>>;

/// An input probe running in the background.
struct ProbeAttempt {
    id: u64,
    cancel: CancellationToken,
}

pub(crate) struct SupervisorActor {
    settings: SupervisorSettings,
    state: StreamState,
    store: ConfigStore,
    controller: ProcessController,
    probe: Arc<dyn InputProbe>,
    broadcaster: StatusBroadcaster,
    last_error: Option<String>,
    probe_attempt: Option<ProbeAttempt>,
    next_attempt: u64,
    pending_start: Option<Reply>,
    pending_stop: Option<Reply>,
    commands: mpsc::Receiver<Command>,
    probe_tx: mpsc::UnboundedSender<ProbeOutcome>,
    probe_rx: mpsc::UnboundedReceiver<ProbeOutcome>,
    encoder_rx: mpsc::UnboundedReceiver<EncoderEvent>,
}

impl SupervisorActor {
    pub(crate) fn new(
        settings: SupervisorSettings,
        probe: Arc<dyn InputProbe>,
        broadcaster: StatusBroadcaster,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (encoder_tx, encoder_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let controller =
            ProcessController::new(settings.ffmpeg_path.clone(), settings.stop_grace, encoder_tx);
        let store = ConfigStore::new(StreamConfig::new(settings.input_url.clone()));

        Self {
            settings,
            state: StreamState::Idle,
            store,
            controller,
            probe,
            broadcaster,
            last_error: None,
            probe_attempt: None,
            next_attempt: 1,
            pending_start: None,
            pending_stop: None,
            commands,
            probe_tx,
            probe_rx,
            encoder_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Stream supervisor started");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(outcome) = self.probe_rx.recv() => self.on_probe_finished(outcome),
                Some(event) = self.encoder_rx.recv() => self.on_encoder_event(event),
            }
        }

        info!("Stream supervisor stopped");
    }

    /// Apply one command. Returns `false` once the actor should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        debug!(command = command.name(), state = %self.state, "Handling command");

        match command {
            Command::SetConfig { update, reply } => {
                let _ = reply.send(self.set_config(update));
            }
            Command::Start { reply } => self.start(reply),
            Command::Stop { reply } => self.stop(reply),
            Command::GetStatus { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Subscribe { reply } => {
                let subscription = self
                    .broadcaster
                    .register(StreamEvent::StreamStatus(self.snapshot()));
                let _ = reply.send(subscription);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn set_config(&mut self, update: ConfigUpdate) -> Result<String> {
        update.validate()?;
        self.store.apply(update);

        let config = self.store.get();
        info!(
            input = %config.input_address,
            output = %config.output_address,
            key = %config.masked_credential(),
            "Stream configuration updated"
        );

        self.broadcast(StreamEvent::ConfigUpdated {
            message: MSG_CONFIG_SAVED.to_string(),
            status: self.snapshot(),
        });
        Ok(MSG_CONFIG_SAVED.to_string())
    }

    fn start(&mut self, reply: Reply) {
        if self.state.is_busy() {
            warn!(state = %self.state, "Start rejected, stream already running");
            let _ = reply.send(Err(Error::AlreadyRunning));
            return;
        }

        let config = match self.store.validate_for_start() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Start rejected");
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.last_error = None;
        self.transition(StreamState::Starting);
        self.pending_start = Some(reply);
        self.spawn_probe(config);
        self.broadcast(StreamEvent::StreamStatus(self.snapshot()));
    }

    fn spawn_probe(&mut self, config: StreamConfig) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let cancel = CancellationToken::new();
        self.probe_attempt = Some(ProbeAttempt {
            id: attempt,
            cancel: cancel.clone(),
        });

        let probe = self.probe.clone();
        let timeout = self.settings.probe_timeout;
        let tx = self.probe_tx.clone();

        info!(attempt, input = %config.input_address, "Probing input before start");

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(attempt, "Input probe cancelled");
                    return;
                }
                result = tokio::time::timeout(timeout, probe.probe(&config.input_address, timeout)) => {
                    result.unwrap_or(Err(Error::InputUnavailable(ProbeFailure::Timeout)))
                }
            };
            let _ = tx.send(ProbeOutcome {
                attempt,
                config,
                result,
            });
        });
    }

    fn on_probe_finished(&mut self, outcome: ProbeOutcome) {
        match &self.probe_attempt {
            Some(current) if current.id == outcome.attempt => {}
            _ => {
                debug!(attempt = outcome.attempt, "Ignoring stale probe result");
                return;
            }
        }
        self.probe_attempt = None;

        if let Err(e) = outcome.result {
            self.fail_start(e);
            return;
        }

        match self.controller.start(&outcome.config) {
            // Live once the watcher reports the process as started.
            Ok(id) => debug!(%id, "Encoder spawned, waiting for start confirmation"),
            Err(e) => self.fail_start(e),
        }
    }

    /// Starting -> Idle with an error for the caller and observers.
    fn fail_start(&mut self, error: Error) {
        error!(error = %error, "Stream failed to start");
        self.last_error = Some(error.to_string());
        self.transition(StreamState::Idle);
        self.broadcast(StreamEvent::StreamError {
            message: error.to_string(),
            status: self.snapshot(),
        });
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn stop(&mut self, reply: Reply) {
        match self.state {
            StreamState::Idle | StreamState::Stopping => {
                warn!(state = %self.state, "Stop rejected, nothing running");
                let _ = reply.send(Err(Error::NotRunning));
            }
            StreamState::Starting if !self.controller.is_running() => {
                // Probe still in flight: nothing was spawned yet.
                if let Some(attempt) = self.probe_attempt.take() {
                    attempt.cancel.cancel();
                }
                info!("Stream start cancelled before the encoder was spawned");
                self.transition(StreamState::Idle);
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Err(Error::Cancelled));
                }
                self.broadcast(StreamEvent::StreamStopped {
                    message: MSG_START_CANCELLED.to_string(),
                    status: self.snapshot(),
                });
                let _ = reply.send(Ok(MSG_START_CANCELLED.to_string()));
            }
            StreamState::Starting | StreamState::Live => {
                self.controller.stop();
                self.transition(StreamState::Stopping);
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Err(Error::Cancelled));
                }
                self.pending_stop = Some(reply);
                info!("Stopping stream");
                self.broadcast(StreamEvent::StreamStatus(self.snapshot()));
            }
        }
    }

    fn on_encoder_event(&mut self, event: EncoderEvent) {
        let current = self.controller.handle().map(|h| h.id());
        if current != Some(event.id) {
            debug!(id = %event.id, "Ignoring event from a previous encoder");
            return;
        }

        match event.event {
            LifecycleEvent::Started { command_summary } => {
                if self.state != StreamState::Starting {
                    debug!(state = %self.state, "Encoder started while not starting");
                    return;
                }
                debug!(command = %command_summary, "Encoder confirmed running");
                self.transition(StreamState::Live);
                info!("Stream is live");
                self.broadcast(StreamEvent::StreamStarted {
                    message: MSG_STARTED.to_string(),
                    status: self.snapshot(),
                });
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(MSG_STARTED.to_string()));
                }
            }
            LifecycleEvent::Failed { detail } => {
                self.controller.reap(event.id);
                match self.state {
                    StreamState::Stopping => self.finish_stop(),
                    _ => {
                        let error = Error::encoder_runtime(detail);
                        self.last_error = Some(error.to_string());
                        self.transition(StreamState::Idle);
                        self.broadcast(StreamEvent::StreamError {
                            message: error.to_string(),
                            status: self.snapshot(),
                        });
                        if let Some(reply) = self.pending_start.take() {
                            let _ = reply.send(Err(error));
                        }
                    }
                }
            }
            LifecycleEvent::Ended { exit_code } => {
                self.controller.reap(event.id);
                match self.state {
                    StreamState::Stopping => self.finish_stop(),
                    _ => {
                        warn!(?exit_code, "Encoder ended unexpectedly");
                        self.transition(StreamState::Idle);
                        self.broadcast(StreamEvent::StreamStatus(self.snapshot()));
                        if let Some(reply) = self.pending_start.take() {
                            let _ = reply.send(Err(Error::encoder_runtime(
                                "Encoder exited before the stream went live",
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Stopping -> Idle once the encoder is confirmed gone.
    fn finish_stop(&mut self) {
        self.transition(StreamState::Idle);
        info!("Streaming stopped");
        self.broadcast(StreamEvent::StreamStopped {
            message: MSG_STOPPED.to_string(),
            status: self.snapshot(),
        });
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Ok(MSG_STOPPED.to_string()));
        }
    }

    /// Stop whatever is running and wait for the encoder to exit.
    async fn shutdown(&mut self) {
        if let Some(attempt) = self.probe_attempt.take() {
            attempt.cancel.cancel();
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(Error::Cancelled));
        }

        let Some(id) = self.controller.handle().map(|h| h.id()) else {
            return;
        };

        info!(%id, "Stopping encoder for shutdown");
        self.controller.stop();

        let wait = async {
            while let Some(event) = self.encoder_rx.recv().await {
                if event.id == id
                    && matches!(
                        event.event,
                        LifecycleEvent::Ended { .. } | LifecycleEvent::Failed { .. }
                    )
                {
                    break;
                }
            }
        };

        if tokio::time::timeout(self.settings.stop_grace + SHUTDOWN_MARGIN, wait)
            .await
            .is_err()
        {
            warn!(%id, "Encoder did not exit before shutdown deadline");
        }
        self.controller.reap(id);
        self.state = StreamState::Idle;
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Ok(MSG_STOPPED.to_string()));
        }
    }

    fn transition(&mut self, target: StreamState) {
        match self.state.transition_to(target) {
            Ok(next) => {
                debug!(from = %self.state, to = %next, "State transition");
                self.state = next;
            }
            Err(e) => error!(error = %e, "Refusing state transition"),
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            is_streaming: self.state.is_streaming(),
            config: self.store.get(),
            last_error: self.last_error.clone(),
            started_at: self.controller.handle().map(|h| h.started_at()),
        }
    }

    fn broadcast(&self, event: StreamEvent) {
        self.broadcaster.notify(&event);
    }
}
