//! Status WebSocket route.
//!
//! Each connection is registered as an observer: it receives a status
//! snapshot first, then every broadcast event as a JSON text frame. Clients
//! may also drive the stream over the same socket; rejections are answered to
//! that socket only.

use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::server::AppState;
use crate::broadcast::StreamEvent;
use crate::config::ConfigUpdate;
use crate::error::Error;
use crate::supervisor::SupervisorHandle;

/// Heartbeat ping interval in seconds.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Frames queued for this socket only.
const DIRECT_QUEUE_CAPACITY: usize = 16;

/// Request sent by a client, e.g. `{"action":"start"}`.
///
/// The event names of earlier clients (`setYouTubeConfig`, `startStream`,
/// `stopStream`) are accepted too.
#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientAction {
    #[serde(alias = "setYouTubeConfig")]
    SetConfig(ConfigUpdate),
    #[serde(alias = "startStream")]
    Start,
    #[serde(alias = "stopStream")]
    Stop,
    GetStatus,
}

impl ClientAction {
    fn name(&self) -> &'static str {
        match self {
            Self::SetConfig(_) => "setConfig",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::GetStatus => "getStatus",
        }
    }
}

/// Frames addressed to a single socket.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
enum DirectFrame {
    Error { code: String, message: String },
}

/// Create the WebSocket router.
pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(status_ws))
}

async fn status_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // 1. Register; the first queued event is the current snapshot.
    let mut subscription = match state.supervisor.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            if let Some(frame) = error_frame(&e) {
                let _ = sender.send(Message::Text(frame.into())).await;
            }
            let _ = sender.close().await;
            return;
        }
    };
    let observer = subscription.id();
    debug!(%observer, "WebSocket observer connected");

    // 2. Replies to this socket's own actions
    let (direct_tx, mut direct_rx) = mpsc::channel::<String>(DIRECT_QUEUE_CAPACITY);

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    let mut awaiting_pong = false;

    // 3. Event loop
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&state.supervisor, text.as_str(), &direct_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = subscription.recv() => {
                let Some(event) = event else {
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!(%observer, "Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode {} event: {}", event.kind(), e),
                }
            }

            Some(frame) = direct_rx.recv() => {
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            _ = heartbeat_interval.tick() => {
                if awaiting_pong {
                    debug!(%observer, "Client failed to respond to Ping, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_ok() {
                    awaiting_pong = true;
                } else {
                    break;
                }
            }
        }
    }

    // Dropping the subscription removes the observer.
    debug!(%observer, "WebSocket observer disconnected");
}

/// Parse a client frame and run it in the background.
///
/// `start` and `stop` resolve only once the stream settles, so they must not
/// block this socket's event loop.
async fn dispatch(supervisor: &SupervisorHandle, text: &str, direct_tx: &mpsc::Sender<String>) {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            let frame = encode_direct(DirectFrame::Error {
                code: "BAD_REQUEST".to_string(),
                message: format!("Invalid action: {e}"),
            });
            if let Some(frame) = frame {
                queue_direct(direct_tx, frame);
            }
            return;
        }
    };
    debug!(action = action.name(), "WebSocket action received");

    let supervisor = supervisor.clone();
    let direct_tx = direct_tx.clone();
    tokio::spawn(async move {
        if let Some(frame) = perform(&supervisor, action).await {
            queue_direct(&direct_tx, frame);
        }
    });
}

/// Queue a frame for this socket, dropping it when the client is not reading.
fn queue_direct(direct_tx: &mpsc::Sender<String>, frame: String) {
    if let Err(mpsc::error::TrySendError::Full(_)) = direct_tx.try_send(frame) {
        debug!("Direct frame queue full, dropping frame");
    }
}

/// Run an action. Returns the frame owed to the requesting socket, if any.
async fn perform(supervisor: &SupervisorHandle, action: ClientAction) -> Option<String> {
    let result = match action {
        ClientAction::GetStatus => {
            return match supervisor.status().await {
                Ok(status) => serde_json::to_string(&StreamEvent::StreamStatus(status)).ok(),
                Err(e) => error_frame(&e),
            };
        }
        ClientAction::SetConfig(update) => supervisor.set_config(update).await,
        ClientAction::Start => supervisor.start().await,
        ClientAction::Stop => supervisor.stop().await,
    };

    match result {
        Ok(_) => None,
        Err(e) => error_frame(&e),
    }
}

/// Error frame for rejected requests.
///
/// Failures the supervisor already broadcast to every observer get no frame.
fn error_frame(err: &Error) -> Option<String> {
    if matches!(
        err,
        Error::InputUnavailable(_)
            | Error::EncoderMissing(_)
            | Error::EncoderRuntime(_)
            | Error::Cancelled
    ) {
        return None;
    }
    encode_direct(DirectFrame::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    })
}

fn encode_direct(frame: DirectFrame) -> Option<String> {
    serde_json::to_string(&frame)
        .inspect_err(|e| warn!("Failed to encode frame: {}", e))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{InputProbe, ProbeFailure};
    use crate::supervisor::{Supervisor, SupervisorSettings};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct RefusingProbe;

    #[async_trait]
    impl InputProbe for RefusingProbe {
        async fn probe(&self, _input: &str, _timeout: Duration) -> crate::Result<()> {
            Err(Error::InputUnavailable(ProbeFailure::ConnectionRefused))
        }
    }

    fn supervisor() -> SupervisorHandle {
        Supervisor::spawn_with_probe(SupervisorSettings::default(), Arc::new(RefusingProbe))
    }

    #[test]
    fn test_parse_actions() {
        let action: ClientAction = serde_json::from_str(r#"{"action":"start"}"#).unwrap();
        assert_eq!(action.name(), "start");

        let action: ClientAction = serde_json::from_str(
            r#"{"action":"setConfig","youtubeUrl":"rtmp://out","youtubeKey":"k"}"#,
        )
        .unwrap();
        match action {
            ClientAction::SetConfig(update) => {
                assert_eq!(update.output_address, "rtmp://out");
                assert_eq!(update.output_credential, "k");
            }
            _ => panic!("expected setConfig"),
        }

        let action: ClientAction = serde_json::from_str(
            r#"{"action":"setYouTubeConfig","url":"rtmp://yt","key":"secret"}"#,
        )
        .unwrap();
        match action {
            ClientAction::SetConfig(update) => assert_eq!(update.output_credential, "secret"),
            _ => panic!("expected setConfig"),
        }

        let action: ClientAction = serde_json::from_str(r#"{"action":"stopStream"}"#).unwrap();
        assert_eq!(action.name(), "stop");

        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"explode"}"#).is_err());
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = error_frame(&Error::AlreadyRunning).unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "ALREADY_RUNNING");
        assert_eq!(json["data"]["message"], "Stream is already running");
    }

    #[test]
    fn test_broadcast_failures_get_no_frame() {
        assert!(error_frame(&Error::InputUnavailable(ProbeFailure::Timeout)).is_none());
        assert!(error_frame(&Error::Cancelled).is_none());
        assert!(error_frame(&Error::NotRunning).is_some());
    }

    #[tokio::test]
    async fn test_start_without_config_is_answered_directly() {
        let supervisor = supervisor();
        let frame = perform(&supervisor, ClientAction::Start).await.unwrap();
        assert!(frame.contains("CONFIG_INVALID"));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_answered_directly() {
        let supervisor = supervisor();
        let frame = perform(&supervisor, ClientAction::Stop).await.unwrap();
        assert!(frame.contains("NOT_RUNNING"));
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_status_returns_snapshot() {
        let supervisor = supervisor();
        let frame = perform(&supervisor, ClientAction::GetStatus).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["event"], "streamStatus");
        assert_eq!(json["data"]["state"], "IDLE");
        assert_eq!(json["data"]["isStreaming"], false);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frames_never_block_dispatch() {
        let supervisor = supervisor();
        let (direct_tx, mut direct_rx) = mpsc::channel(DIRECT_QUEUE_CAPACITY);

        tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..DIRECT_QUEUE_CAPACITY * 2 {
                dispatch(&supervisor, "not json", &direct_tx).await;
            }
        })
        .await
        .expect("dispatch blocked on a full queue");

        let mut queued = 0;
        while let Ok(frame) = direct_rx.try_recv() {
            assert!(frame.contains("BAD_REQUEST"));
            queued += 1;
        }
        assert_eq!(queued, DIRECT_QUEUE_CAPACITY);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_failure_is_only_broadcast() {
        let supervisor = supervisor();
        let mut subscription = supervisor.subscribe().await.unwrap();
        let _snapshot = subscription.recv().await.unwrap();

        let config = ConfigUpdate::output("rtmp://out", "key");
        assert!(perform(&supervisor, ClientAction::SetConfig(config)).await.is_none());
        assert!(perform(&supervisor, ClientAction::Start).await.is_none());

        let mut kinds = Vec::new();
        while let Some(event) = subscription.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["configUpdated", "streamStatus", "streamError"]);
        supervisor.shutdown().await.unwrap();
    }
}
