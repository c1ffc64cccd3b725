use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use valet_notify::{ConnectionKind, ServerEvent, SubscriptionAction, is_valid_session_id};

use crate::AppState;

/// Policy violation close code used for malformed session ids.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/ws/audio/{session_id}", get(audio_socket))
        .route("/ws/queue/{session_id}", get(queue_socket))
}

async fn audio_socket(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_audio(socket, state, session_id))
}

async fn queue_socket(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_queue(socket, state, session_id))
}

async fn reject_invalid_session(mut socket: WebSocket, session_id: &str) {
    warn!(session_id, "rejecting connection with invalid session id");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "invalid session id".into(),
        })))
        .await;
}

/// Audio stream consumers. User association is optional at connect time and
/// picked up from pre-registration when present.
async fn handle_audio(socket: WebSocket, state: AppState, session_id: String) {
    if !is_valid_session_id(&session_id) {
        return reject_invalid_session(socket, &session_id).await;
    }

    let events = state
        .fabric
        .connect(&session_id, ConnectionKind::Audio, None, None);
    info!(session_id, "audio socket connected");

    let (mut sink, mut stream) = socket.split();
    let _ = sink
        .send(text_message(&json!({
            "type": "connect",
            "text": format!("Audio WebSocket connected for session {session_id}"),
            "session_id": session_id,
        })))
        .await;

    pump(&mut sink, &mut stream, events, &state, &session_id, false).await;
    state.fabric.disconnect(&session_id);
    info!(session_id, "audio socket disconnected");
}

/// Queue/event subscribers. The first client message must be an
/// `auth_request` carrying a verifiable token; everything before that is a
/// protocol error that closes the socket.
async fn handle_queue(mut socket: WebSocket, state: AppState, session_id: String) {
    if !is_valid_session_id(&session_id) {
        return reject_invalid_session(socket, &session_id).await;
    }

    // ── Auth handshake ───────────────────────────────────────────────────────
    let first = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text.to_string(),
        _ => {
            debug!(session_id, "queue socket closed before auth");
            return;
        }
    };
    let auth: Value = serde_json::from_str(&first).unwrap_or(Value::Null);
    let token = auth.get("token").and_then(Value::as_str);
    let is_auth_request = auth.get("type").and_then(Value::as_str) == Some("auth_request");

    let user = match (is_auth_request, token) {
        (true, Some(token)) => state.verifier.verify(token),
        _ => None,
    };
    let Some(user) = user else {
        let _ = socket
            .send(text_message(&json!({
                "type": "auth_error",
                "message": "first message must be auth_request with a valid token",
            })))
            .await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let subscriptions = auth
        .get("subscribed_events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

    let events = state.fabric.connect(
        &session_id,
        ConnectionKind::Queue,
        Some(user.user_id.clone()),
        subscriptions,
    );
    info!(session_id, user_id = %user.user_id, "queue socket authenticated");

    let (mut sink, mut stream) = socket.split();
    let _ = sink
        .send(text_message(&json!({
            "type": "auth_success",
            "message": "Authentication successful",
            "session_id": session_id,
        })))
        .await;
    let _ = sink
        .send(text_message(&json!({
            "type": "connect",
            "message": format!("Queue WebSocket connected for session {session_id}"),
            "session_id": session_id,
        })))
        .await;

    pump(&mut sink, &mut stream, events, &state, &session_id, true).await;
    state.fabric.disconnect(&session_id);
    info!(session_id, "queue socket disconnected");
}

/// Shared send/receive loop: fan-out events flow to the sink, client control
/// messages are answered inline.
async fn pump(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    stream: &mut futures::stream::SplitStream<WebSocket>,
    mut events: mpsc::Receiver<ServerEvent>,
    state: &AppState,
    session_id: &str,
    control_messages: bool,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if sink.send(text_message(&event.to_json())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if control_messages => {
                        if let Some(reply) = control_response(state, session_id, text.as_str()) {
                            if sink.send(text_message(&reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(session_id, %err, "socket receive error");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle `sys_ping` and `update_subscriptions`; anything else gets an error
/// envelope so clients notice their typos.
fn control_response(state: &AppState, session_id: &str, text: &str) -> Option<Value> {
    let message: Value = serde_json::from_str(text).ok()?;
    match message.get("type").and_then(Value::as_str) {
        Some("sys_ping") => Some(json!({ "type": "sys_pong" })),
        Some("update_subscriptions") => {
            let events: Vec<String> = message
                .get("events")
                .and_then(Value::as_array)
                .map(|events| {
                    events
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let action = message
                .get("action")
                .and_then(Value::as_str)
                .and_then(SubscriptionAction::parse)
                .unwrap_or(SubscriptionAction::Replace);
            match state.fabric.update_subscriptions(session_id, events, action) {
                Some(subscriptions) => Some(json!({
                    "type": "subscription_update",
                    "success": true,
                    "subscriptions": subscriptions,
                })),
                None => Some(json!({
                    "type": "error",
                    "message": "session not registered",
                })),
            }
        }
        Some(other) => Some(json!({
            "type": "error",
            "message": format!("unsupported message type '{other}'"),
        })),
        None => Some(json!({
            "type": "error",
            "message": "message missing a type tag",
        })),
    }
}

fn text_message(value: &Value) -> Message {
    Message::Text(value.to_string().into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::bail;
    use tokio::sync::Mutex;

    use valet_config::ConfigSnapshot;
    use valet_exec::CodeRunner;
    use valet_llm::{Completion, CompletionClient, EmbeddingClient, LlmSpec};
    use valet_memory::{EmbeddingService, GistNormalizer, IoLog, SnapshotStore};
    use valet_notify::{Fabric, NotificationLog};
    use valet_queue::{IoSink, Scheduler};

    use super::*;
    use crate::auth::StaticTokenVerifier;

    #[derive(Debug)]
    struct NoLlm;

    #[async_trait::async_trait]
    impl CompletionClient for NoLlm {
        async fn complete(&self, _spec: &LlmSpec, _prompt: &str) -> anyhow::Result<Completion> {
            bail!("unused")
        }
    }

    #[derive(Debug)]
    struct NoEmbeddings;

    #[async_trait::async_trait]
    impl EmbeddingClient for NoEmbeddings {
        async fn embed(&self, _model: &str, _text: &str) -> anyhow::Result<Vec<f32>> {
            bail!("unused")
        }
    }

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let embeddings = Arc::new(
            EmbeddingService::open(
                dir.path().join("cache.redb"),
                Arc::new(NoEmbeddings),
                GistNormalizer::default(),
                "stub",
                false,
            )
            .unwrap(),
        );
        let snapshots = Arc::new(Mutex::new(
            SnapshotStore::open(dir.path().join("solutions"), embeddings.clone()).unwrap(),
        ));
        let io_log = Arc::new(IoLog::new(dir.path().join("io.jsonl"), embeddings));
        let fabric = Arc::new(Fabric::new());
        let scheduler = Arc::new(Scheduler::new(
            ConfigSnapshot::default(),
            Arc::new(NoLlm),
            CodeRunner::new("sh", Duration::from_secs(5)),
            snapshots,
            IoSink::Sync(io_log),
            fabric.clone(),
            Arc::new(NotificationLog::new(dir.path().join("notifications.jsonl"))),
        ));
        let verifier = Arc::new(
            StaticTokenVerifier::new().with_user("mock_token_alice", "alice", "a@example.com", false),
        );
        (dir, AppState { scheduler, fabric, verifier })
    }

    #[tokio::test]
    async fn sys_ping_gets_sys_pong() {
        let (_dir, state) = test_state();
        let reply = control_response(&state, "wise penguin", r#"{"type":"sys_ping"}"#).unwrap();
        assert_eq!(reply["type"], "sys_pong");
    }

    #[tokio::test]
    async fn subscription_update_round_trips_through_the_fabric() {
        let (_dir, state) = test_state();
        let _rx = state.fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );

        let reply = control_response(
            &state,
            "wise penguin",
            r#"{"type":"update_subscriptions","events":["todo_update"],"action":"replace"}"#,
        )
        .unwrap();
        assert_eq!(reply["type"], "subscription_update");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["subscriptions"], json!(["todo_update"]));
        assert_eq!(
            state.fabric.session_subscriptions("wise penguin").unwrap(),
            vec!["todo_update"]
        );
    }

    #[tokio::test]
    async fn unknown_session_subscription_update_is_an_error() {
        let (_dir, state) = test_state();
        let reply = control_response(
            &state,
            "ghost session",
            r#"{"type":"update_subscriptions","events":[],"action":"replace"}"#,
        )
        .unwrap();
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn unsupported_and_untyped_messages_get_error_envelopes() {
        let (_dir, state) = test_state();
        let reply = control_response(&state, "wise penguin", r#"{"type":"dance"}"#).unwrap();
        assert_eq!(reply["type"], "error");

        let reply = control_response(&state, "wise penguin", r#"{"hello":"there"}"#).unwrap();
        assert_eq!(reply["type"], "error");

        // Non-JSON input is ignored entirely.
        assert!(control_response(&state, "wise penguin", "not json").is_none());
    }
}
