//! Integration tests for the stream supervisor.
//!
//! The encoder is replaced by small shell scripts and the input probe by
//! in-process stubs, so no ffmpeg or RTMP server is needed.

#![cfg(unix)]

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use restream::Error;
use restream::broadcast::{StreamEvent, Subscription};
use restream::config::ConfigUpdate;
use restream::probe::{InputProbe, ProbeFailure};
use restream::supervisor::{StreamState, Supervisor, SupervisorHandle, SupervisorSettings};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in encoder binaries.
struct Scripts {
    _dir: TempDir,
    /// Runs until signalled; answers `-version`.
    live: String,
    /// Exits cleanly shortly after starting.
    quick_exit: String,
    /// Reports a refused input connection and exits non-zero.
    crash: String,
    /// Ignores SIGTERM.
    stubborn: String,
    /// Writes bytes that are not UTF-8, then keeps logging.
    garbled: String,
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

/// Scripts are written once, before any test spawns a process, so no child
/// inherits a write handle to them.
fn scripts() -> &'static Scripts {
    static SCRIPTS: OnceLock<Scripts> = OnceLock::new();
    SCRIPTS.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let live = write_script(
            dir.path(),
            "live.sh",
            r#"if [ "$1" = "-version" ]; then echo "ffmpeg version 6.1-test"; exit 0; fi
exec sleep 30"#,
        );
        let quick_exit = write_script(dir.path(), "quick_exit.sh", "sleep 0.3\nexit 0");
        let crash = write_script(
            dir.path(),
            "crash.sh",
            "echo \"rtmp://127.0.0.1/live/test: Connection refused\" >&2\nsleep 0.2\nexit 1",
        );
        let stubborn = write_script(
            dir.path(),
            "stubborn.sh",
            "trap '' TERM\nwhile :; do sleep 0.1; done",
        );
        let garbled = write_script(
            dir.path(),
            "garbled.sh",
            "printf 'Metadata title: \\377\\376\\n' >&2\nsleep 0.5\necho 'frame=1' >&2\nexec sleep 30",
        );
        Scripts {
            _dir: dir,
            live,
            quick_exit,
            crash,
            stubborn,
            garbled,
        }
    })
}

struct ReadyProbe;

#[async_trait]
impl InputProbe for ReadyProbe {
    async fn probe(&self, _input: &str, _timeout: Duration) -> restream::Result<()> {
        Ok(())
    }
}

struct RefusingProbe;

#[async_trait]
impl InputProbe for RefusingProbe {
    async fn probe(&self, _input: &str, _timeout: Duration) -> restream::Result<()> {
        Err(Error::InputUnavailable(ProbeFailure::ConnectionRefused))
    }
}

/// Ignores its deadline entirely.
struct SlowProbe;

#[async_trait]
impl InputProbe for SlowProbe {
    async fn probe(&self, _input: &str, _timeout: Duration) -> restream::Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

fn settings(ffmpeg_path: &str) -> SupervisorSettings {
    SupervisorSettings {
        ffmpeg_path: ffmpeg_path.to_string(),
        input_url: "rtmp://127.0.0.1:1935/live/test".to_string(),
        probe_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_secs(2),
    }
}

async fn spawn_configured(
    settings: SupervisorSettings,
    probe: impl InputProbe + 'static,
) -> SupervisorHandle {
    let supervisor = Supervisor::spawn_with_probe(settings, Arc::new(probe));
    supervisor
        .set_config(ConfigUpdate::output(
            "rtmp://a.rtmp.youtube.com/live2",
            "abcd-efgh-ijkl",
        ))
        .await
        .unwrap();
    supervisor
}

async fn next_event(subscription: &mut Subscription) -> StreamEvent {
    tokio::time::timeout(EVENT_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
}

async fn wait_for(subscription: &mut Subscription, kind: &str) -> StreamEvent {
    loop {
        let event = next_event(subscription).await;
        if event.kind() == kind {
            return event;
        }
    }
}

/// Drain queued events without waiting.
fn drain_kinds(subscription: &mut Subscription) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Some(event) = subscription.try_recv() {
        kinds.push(event.kind());
    }
    kinds
}

mod config_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_without_config_is_rejected() {
        let scripts = scripts();
        let supervisor =
            Supervisor::spawn_with_probe(settings(&scripts.live), Arc::new(ReadyProbe));

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Idle);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_config_broadcasts_config_updated() {
        let scripts = scripts();
        let supervisor =
            Supervisor::spawn_with_probe(settings(&scripts.live), Arc::new(ReadyProbe));
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let message = supervisor
            .set_config(ConfigUpdate::output("rtmp://out", "key1234"))
            .await
            .unwrap();
        assert_eq!(message, "Output configuration saved");

        let event = next_event(&mut subscription).await;
        assert_eq!(event.kind(), "configUpdated");
        assert_eq!(event.status().config.output_address, "rtmp://out");

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_on_subscribe_matches_status() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;

        let mut subscription = supervisor.subscribe().await.unwrap();
        let first = next_event(&mut subscription).await;
        let status = supervisor.status().await.unwrap();

        assert_eq!(first, StreamEvent::StreamStatus(status));
        assert_eq!(supervisor.observer_count(), 1);

        drop(subscription);
        assert_eq!(supervisor.observer_count(), 0);

        supervisor.shutdown().await.unwrap();
    }
}

mod start_tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_input_returns_to_idle() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), RefusingProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InputUnavailable(ProbeFailure::ConnectionRefused)
        ));

        let starting = next_event(&mut subscription).await;
        assert_eq!(starting.kind(), "streamStatus");
        assert_eq!(starting.status().state, StreamState::Starting);

        let failed = next_event(&mut subscription).await;
        assert_eq!(failed.kind(), "streamError");
        assert!(failed.message().unwrap_or_default().contains("connection-refused"));
        assert_eq!(failed.status().state, StreamState::Idle);

        let status = supervisor.status().await.unwrap();
        assert_eq!(status.state, StreamState::Idle);
        assert!(status.last_error.is_some());

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_start_goes_live_once() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let message = supervisor.start().await.unwrap();
        assert_eq!(message, "Stream started successfully");

        let status = supervisor.status().await.unwrap();
        assert_eq!(status.state, StreamState::Live);
        assert!(status.is_streaming);
        assert!(status.started_at.is_some());
        assert!(status.last_error.is_none());

        let kinds = drain_kinds(&mut subscription);
        assert_eq!(kinds, vec!["streamStatus", "streamStarted"]);

        supervisor.stop().await.unwrap();
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_one() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;

        let (first, second) = tokio::join!(supervisor.start(), supervisor.start());
        let results = [first, second];

        let live = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(Error::AlreadyRunning)))
            .count();
        assert_eq!(live, 1);
        assert_eq!(rejected, 1);

        supervisor.stop().await.unwrap();
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_while_live_is_rejected() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;
        supervisor.start().await.unwrap();

        assert!(matches!(
            supervisor.start().await,
            Err(Error::AlreadyRunning)
        ));
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Live);

        supervisor.stop().await.unwrap();
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let scripts = scripts();
        let mut settings = settings(&scripts.live);
        settings.probe_timeout = Duration::from_millis(300);
        let supervisor = spawn_configured(settings, SlowProbe).await;

        let began = Instant::now();
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::InputUnavailable(ProbeFailure::Timeout)));
        assert!(began.elapsed() < Duration::from_secs(3));
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Idle);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_encoder_is_reported() {
        let supervisor =
            spawn_configured(settings("/nonexistent/restream-ffmpeg"), ReadyProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::EncoderMissing(_)));
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Idle);
        wait_for(&mut subscription, "streamError").await;

        supervisor.shutdown().await.unwrap();
    }
}

mod stop_tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_when_idle_is_silent() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        assert!(matches!(supervisor.stop().await, Err(Error::NotRunning)));
        // Round-trip through the actor so any broadcast would have landed.
        supervisor.status().await.unwrap();
        assert!(drain_kinds(&mut subscription).is_empty());

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_live_stream() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;
        supervisor.start().await.unwrap();

        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let message = supervisor.stop().await.unwrap();
        assert_eq!(message, "Stream stopped successfully");

        let stopping = next_event(&mut subscription).await;
        assert_eq!(stopping.status().state, StreamState::Stopping);

        let stopped = next_event(&mut subscription).await;
        assert_eq!(stopped.kind(), "streamStopped");
        assert_eq!(stopped.status().state, StreamState::Idle);
        assert!(!stopped.status().is_streaming);
        assert!(stopped.status().started_at.is_none());

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_during_probe_cancels_start() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), SlowProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        };
        let starting = next_event(&mut subscription).await;
        assert_eq!(starting.status().state, StreamState::Starting);

        let message = supervisor.stop().await.unwrap();
        assert_eq!(message, "Stream start cancelled");

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        let stopped = next_event(&mut subscription).await;
        assert_eq!(stopped.kind(), "streamStopped");
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Idle);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;

        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Live);

        supervisor.stop().await.unwrap();
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stubborn_encoder_is_killed() {
        let scripts = scripts();
        let mut settings = settings(&scripts.stubborn);
        settings.stop_grace = Duration::from_millis(300);
        let supervisor = spawn_configured(settings, ReadyProbe).await;

        supervisor.start().await.unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let began = Instant::now();
        supervisor.stop().await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(supervisor.status().await.unwrap().state, StreamState::Idle);

        supervisor.shutdown().await.unwrap();
    }
}

mod encoder_exit_tests {
    use super::*;

    #[tokio::test]
    async fn test_unexpected_exit_returns_to_idle() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.quick_exit), ReadyProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        supervisor.start().await.unwrap();
        wait_for(&mut subscription, "streamStarted").await;

        let ended = wait_for(&mut subscription, "streamStatus").await;
        assert_eq!(ended.status().state, StreamState::Idle);
        assert!(!ended.status().is_streaming);

        assert!(matches!(supervisor.stop().await, Err(Error::NotRunning)));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_is_reported() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.crash), ReadyProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        let _ = supervisor.start().await;

        let failed = wait_for(&mut subscription, "streamError").await;
        assert_eq!(failed.status().state, StreamState::Idle);
        assert!(failed.message().unwrap_or_default().contains("relay"));

        let status = supervisor.status().await.unwrap();
        assert!(status.last_error.unwrap().contains("relay"));

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_output_keeps_stream_live() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.garbled), ReadyProbe).await;
        let mut subscription = supervisor.subscribe().await.unwrap();
        next_event(&mut subscription).await;

        supervisor.start().await.unwrap();
        wait_for(&mut subscription, "streamStarted").await;

        // Long enough for the encoder to write past the bad bytes.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = supervisor.status().await.unwrap();
        assert_eq!(status.state, StreamState::Live);
        assert!(status.is_streaming);

        supervisor.stop().await.unwrap();
        supervisor.shutdown().await.unwrap();
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_encoder() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;
        supervisor.start().await.unwrap();

        supervisor.shutdown().await.unwrap();
        assert!(matches!(
            supervisor.status().await,
            Err(Error::SupervisorUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_health_reports_encoder_and_input() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), ReadyProbe).await;

        let report = supervisor.health().await.unwrap();
        assert!(report.is_healthy());
        assert!(report.encoder.available);
        assert_eq!(
            report.encoder.version.as_deref(),
            Some("ffmpeg version 6.1-test")
        );
        assert_eq!(report.input.address, "rtmp://127.0.0.1:1935/live/test");

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_encoder_health_skips_input_check() {
        let scripts = scripts();
        let supervisor = spawn_configured(settings(&scripts.live), SlowProbe).await;

        let encoder = tokio::time::timeout(Duration::from_secs(1), supervisor.encoder_health())
            .await
            .expect("encoder check waited on the input");
        assert!(encoder.available);

        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_input() {
        let supervisor =
            spawn_configured(settings("/nonexistent/restream-ffmpeg"), RefusingProbe).await;

        let report = supervisor.health().await.unwrap();
        assert!(!report.is_healthy());
        assert!(!report.encoder.available);
        assert!(!report.input.available);
        assert_eq!(report.input.reason.as_deref(), Some("connection-refused"));
        // Diagnostics do not touch the stream state.
        assert_eq!(report.state, StreamState::Idle);

        supervisor.shutdown().await.unwrap();
    }
}
