//! Encoder process controller.
//!
//! Owns the single [`EncoderHandle`] and a background watcher per spawned
//! process. The watcher forwards lifecycle events tagged with the process's
//! [`EncoderId`], so events from an earlier process can be told apart from
//! the current one.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::policy::{EncodingPolicy, build_args};
use crate::config::StreamConfig;
use crate::{Error, Result};

/// Number of stderr lines kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for buffered stderr after the process exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Longest stderr line kept; the rest of an overlong line is dropped.
const MAX_STDERR_LINE_BYTES: usize = 4096;

/// Identity of one spawned encoder process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderId(pub u64);

impl std::fmt::Display for EncoderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encoder-{}", self.0)
    }
}

/// Lifecycle signal raised by a running encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The process is running.
    Started { command_summary: String },
    /// The process died on its own with an error.
    Failed { detail: String },
    /// The process exited cleanly or was stopped on request.
    Ended { exit_code: Option<i32> },
}

/// A lifecycle event tagged with the process it belongs to.
#[derive(Debug, Clone)]
pub struct EncoderEvent {
    pub id: EncoderId,
    pub event: LifecycleEvent,
}

/// Live encoder subprocess.
///
/// Not `Clone`: there is at most one, held by the [`ProcessController`]
/// until its watcher confirms the process is gone.
#[derive(Debug)]
pub struct EncoderHandle {
    id: EncoderId,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stop_token: CancellationToken,
}

impl EncoderHandle {
    pub fn id(&self) -> EncoderId {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

/// Starts, stops and reaps the encoder subprocess.
pub struct ProcessController {
    binary_path: String,
    policy: EncodingPolicy,
    stop_grace: Duration,
    events: mpsc::UnboundedSender<EncoderEvent>,
    handle: Option<EncoderHandle>,
    next_id: u64,
}

impl ProcessController {
    /// Create a controller that reports lifecycle events on `events`.
    pub fn new(
        binary_path: impl Into<String>,
        stop_grace: Duration,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            policy: EncodingPolicy::default(),
            stop_grace,
            events,
            handle: None,
            next_id: 1,
        }
    }

    /// The current handle, if a process is alive.
    pub fn handle(&self) -> Option<&EncoderHandle> {
        self.handle.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the encoder for `config`.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a handle exists,
    /// [`Error::EncoderMissing`] when the binary cannot be found.
    pub fn start(&mut self, config: &StreamConfig) -> Result<EncoderId> {
        if self.handle.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let args = build_args(&self.policy, config);
        let command_summary = self.command_summary(&args, config);

        let mut child = process_utils::tokio_command(&self.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    error!(binary = %self.binary_path, "Encoder binary not found");
                    Error::EncoderMissing(self.binary_path.clone())
                }
                _ => Error::encoder_runtime(format!("Failed to spawn encoder: {}", e)),
            })?;

        let id = EncoderId(self.next_id);
        self.next_id += 1;

        let stderr = child.stderr.take();
        let pid = child.id();
        let stop_token = CancellationToken::new();

        info!(%id, ?pid, command = %command_summary, "Encoder started");

        tokio::spawn(watch_encoder(
            id,
            child,
            stderr,
            stop_token.clone(),
            self.stop_grace,
            command_summary,
            self.events.clone(),
        ));

        self.handle = Some(EncoderHandle {
            id,
            pid,
            started_at: Utc::now(),
            stop_token,
        });

        Ok(id)
    }

    /// Ask the encoder to terminate.
    ///
    /// Idempotent: without a handle, or with a stop already in progress, this
    /// does nothing. Returns whether a process is being stopped.
    pub fn stop(&mut self) -> bool {
        match &self.handle {
            Some(handle) => {
                if !handle.is_stopping() {
                    info!(id = %handle.id, pid = ?handle.pid, "Stopping encoder");
                    handle.stop_token.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Drop the handle once its process is confirmed gone.
    ///
    /// Returns `false` when `id` is not the current process.
    pub fn reap(&mut self, id: EncoderId) -> bool {
        match &self.handle {
            Some(handle) if handle.id == id => {
                debug!(%id, "Encoder handle released");
                self.handle = None;
                true
            }
            _ => false,
        }
    }

    /// Loggable command line with the stream key masked.
    fn command_summary(&self, args: &[String], config: &StreamConfig) -> String {
        let secret = config.publish_url();
        let masked = format!(
            "{}/{}",
            config.output_address.trim_end_matches('/'),
            config.masked_credential()
        );

        std::iter::once(self.binary_path.as_str())
            .chain(args.iter().map(|a| {
                if *a == secret {
                    masked.as_str()
                } else {
                    a.as_str()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Watch a spawned encoder until it exits, then report how it ended.
async fn watch_encoder(
    id: EncoderId,
    mut child: Child,
    stderr: Option<ChildStderr>,
    stop_token: CancellationToken,
    stop_grace: Duration,
    command_summary: String,
    events: mpsc::UnboundedSender<EncoderEvent>,
) {
    let _ = events.send(EncoderEvent {
        id,
        event: LifecycleEvent::Started { command_summary },
    });

    // Held until the watcher returns so the pipe stays open while the
    // process is alive.
    let mut lines = stderr.map(StderrLines::new);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut stopping = false;
    let mut killed = false;
    let kill_deadline = tokio::time::sleep(Duration::MAX);
    tokio::pin!(kill_deadline);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,

            line = next_line(&mut lines) => {
                if let Some(line) = line {
                    record_line(id, &mut tail, line);
                }
            }

            _ = stop_token.cancelled(), if !stopping => {
                stopping = true;
                if let Err(e) = process_utils::request_terminate(&mut child) {
                    warn!(%id, error = %e, "Failed to signal encoder");
                }
                kill_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + stop_grace);
            }

            _ = &mut kill_deadline, if stopping && !killed => {
                warn!(%id, grace = ?stop_grace, "Encoder ignored termination, killing");
                killed = true;
                if let Err(e) = child.start_kill() {
                    error!(%id, error = %e, "Failed to kill encoder");
                }
            }
        }
    };

    // Pick up whatever the process wrote right before exiting.
    if let Some(lines) = lines.as_mut() {
        while let Ok(Some(line)) =
            tokio::time::timeout(STDERR_DRAIN_TIMEOUT, lines.next_line()).await
        {
            record_line(id, &mut tail, line);
        }
    }

    let event = classify_exit(status, stopping, &tail);
    match &event {
        LifecycleEvent::Failed { detail } => error!(%id, %detail, "Encoder failed"),
        LifecycleEvent::Ended { exit_code } => info!(%id, ?exit_code, "Encoder ended"),
        LifecycleEvent::Started { .. } => {}
    }

    let _ = events.send(EncoderEvent { id, event });
}

async fn next_line(lines: &mut Option<StderrLines<ChildStderr>>) -> Option<String> {
    match lines {
        Some(lines) if !lines.is_done() => lines.next_line().await,
        _ => std::future::pending().await,
    }
}

/// Splits raw encoder output into lines.
///
/// Lines end at `\n` or `\r` and are decoded lossily, so invalid UTF-8 in
/// stream metadata never ends the read.
struct StderrLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> StderrLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            done: false,
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// Next non-empty line, or `None` once the pipe is exhausted.
    async fn next_line(&mut self) -> Option<String> {
        while !self.done {
            let chunk = match self.reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "Encoder stderr read failed");
                    self.done = true;
                    break;
                }
            };
            if chunk.is_empty() {
                self.done = true;
                break;
            }

            match chunk.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    append_capped(&mut self.buf, &chunk[..end]);
                    self.reader.consume(end + 1);
                    if !self.buf.is_empty() {
                        return Some(self.take_line());
                    }
                }
                None => {
                    let len = chunk.len();
                    append_capped(&mut self.buf, chunk);
                    self.reader.consume(len);
                }
            }
        }

        (!self.buf.is_empty()).then(|| self.take_line())
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

fn append_capped(buf: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_STDERR_LINE_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

fn record_line(id: EncoderId, tail: &mut VecDeque<String>, line: String) {
    trace!(%id, "{}", line);
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

/// Decide how the process ended.
///
/// Any exit after a stop request counts as ended, whatever the signal or code.
fn classify_exit(
    status: std::io::Result<ExitStatus>,
    stop_requested: bool,
    tail: &VecDeque<String>,
) -> LifecycleEvent {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return LifecycleEvent::Failed {
                detail: format!("Lost track of encoder process: {}", e),
            };
        }
    };

    if stop_requested || status.success() {
        return LifecycleEvent::Ended {
            exit_code: status.code(),
        };
    }

    LifecycleEvent::Failed {
        detail: failure_detail(status, tail),
    }
}

fn failure_detail(status: ExitStatus, tail: &VecDeque<String>) -> String {
    if tail
        .iter()
        .any(|l| l.to_ascii_lowercase().contains("connection refused"))
    {
        return "Input connection refused, check that the RTMP relay server is running".to_string();
    }

    match tail.iter().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("{} ({})", last.trim(), status),
        None => format!("Encoder exited unexpectedly ({})", status),
    }
}
