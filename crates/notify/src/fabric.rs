use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::{ConnectionKind, SubscriptionAction, audio_event_whitelist};

/// Per-session outbound buffer. A session that cannot drain this many events
/// is closed rather than allowed to stall the emitter.
const SESSION_BUFFER: usize = 256;

/// One event on its way to a client: a `type` tag plus payload fields.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event: String,
    pub payload: Value,
}

impl ServerEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self { event: event.into(), payload }
    }

    /// Wire form: the payload object with the `type` tag merged in.
    pub fn to_json(&self) -> Value {
        let mut merged = match &self.payload {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => json!({}),
            other => json!({ "payload": other }),
        };
        merged["type"] = Value::String(self.event.clone());
        merged
    }
}

struct Session {
    user_id: Option<String>,
    kind: ConnectionKind,
    subscriptions: Vec<String>,
    tx: mpsc::Sender<ServerEvent>,
}

impl Session {
    fn wants(&self, event: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|tag| tag == "*" || tag == event)
    }
}

/// Per-user WebSocket fan-out with subscription filtering.
///
/// Sessions register on connect and may bind to a user either ahead of time
/// (an authenticated HTTP call that mentioned the session id) or lazily via
/// the queue socket's auth handshake. Delivery is best-effort per session: a
/// full or closed buffer disconnects that one session and nobody else.
#[derive(Default)]
pub struct Fabric {
    sessions: RwLock<HashMap<String, Session>>,
    pre_registered: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("sessions", &self.sessions.read().expect("fabric lock").len())
            .finish()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a user to a session id before the socket connects.
    pub fn pre_register_session(&self, session_id: &str, user_id: &str) {
        self.pre_registered
            .write()
            .expect("fabric lock")
            .insert(session_id.to_string(), user_id.to_string());
    }

    /// Register a connected session and hand back the receiving half the
    /// socket writer drains. Audio sessions get the fixed whitelist no matter
    /// what was asked for; queue sessions default to `["*"]`.
    pub fn connect(
        &self,
        session_id: &str,
        kind: ConnectionKind,
        user_id: Option<String>,
        subscriptions: Option<Vec<String>>,
    ) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let user_id = user_id.or_else(|| {
            self.pre_registered
                .read()
                .expect("fabric lock")
                .get(session_id)
                .cloned()
        });
        let subscriptions = match kind {
            ConnectionKind::Audio => audio_event_whitelist(),
            ConnectionKind::Queue => subscriptions.unwrap_or_else(|| vec!["*".to_string()]),
        };
        info!(session_id, ?kind, user = user_id.as_deref(), "session connected");
        self.sessions.write().expect("fabric lock").insert(
            session_id.to_string(),
            Session { user_id, kind, subscriptions, tx },
        );
        rx
    }

    /// Bind a user to an already-connected session (queue-socket auth).
    /// Returns false when the session is unknown.
    pub fn authenticate(
        &self,
        session_id: &str,
        user_id: &str,
        subscriptions: Option<Vec<String>>,
    ) -> bool {
        let mut sessions = self.sessions.write().expect("fabric lock");
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session.user_id = Some(user_id.to_string());
        if let Some(subscriptions) = subscriptions {
            if session.kind == ConnectionKind::Queue {
                session.subscriptions = subscriptions;
            }
        }
        info!(session_id, user_id, "session authenticated");
        true
    }

    pub fn disconnect(&self, session_id: &str) {
        if self
            .sessions
            .write()
            .expect("fabric lock")
            .remove(session_id)
            .is_some()
        {
            debug!(session_id, "session disconnected");
        }
    }

    pub fn session_user(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .expect("fabric lock")
            .get(session_id)
            .and_then(|session| session.user_id.clone())
            .or_else(|| {
                self.pre_registered
                    .read()
                    .expect("fabric lock")
                    .get(session_id)
                    .cloned()
            })
    }

    pub fn session_subscriptions(&self, session_id: &str) -> Option<Vec<String>> {
        self.sessions
            .read()
            .expect("fabric lock")
            .get(session_id)
            .map(|session| session.subscriptions.clone())
    }

    pub fn connected_sessions(&self) -> usize {
        self.sessions.read().expect("fabric lock").len()
    }

    /// Replace/add/remove subscription tags for one session. Returns the new
    /// subscription set, or `None` for an unknown session.
    pub fn update_subscriptions(
        &self,
        session_id: &str,
        events: Vec<String>,
        action: SubscriptionAction,
    ) -> Option<Vec<String>> {
        let mut sessions = self.sessions.write().expect("fabric lock");
        let session = sessions.get_mut(session_id)?;
        match action {
            SubscriptionAction::Replace => session.subscriptions = events,
            SubscriptionAction::Add => {
                for event in events {
                    if !session.subscriptions.contains(&event) {
                        session.subscriptions.push(event);
                    }
                }
            }
            SubscriptionAction::Remove => {
                session.subscriptions.retain(|tag| !events.contains(tag));
            }
        }
        Some(session.subscriptions.clone())
    }

    /// Deliver to every session of `user_id` subscribed to `event` (exact tag
    /// or wildcard). Returns how many sessions the event reached; zero means
    /// it was silently dropped.
    pub fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) -> usize {
        let server_event = ServerEvent::new(event, payload);
        let mut dead: Vec<String> = Vec::new();
        let mut reached = 0usize;
        {
            let sessions = self.sessions.read().expect("fabric lock");
            for (session_id, session) in sessions.iter() {
                if session.user_id.as_deref() != Some(user_id) || !session.wants(event) {
                    continue;
                }
                match session.tx.try_send(server_event.clone()) {
                    Ok(()) => reached += 1,
                    Err(err) => {
                        warn!(session_id, %err, "session send failed — closing that session");
                        dead.push(session_id.clone());
                    }
                }
            }
        }
        for session_id in dead {
            self.disconnect(&session_id);
        }
        reached
    }

    /// Deliver to one session regardless of its user binding (pings,
    /// handshake acks). Subscription filtering still applies.
    pub fn emit_to_session(&self, session_id: &str, event: &str, payload: Value) -> bool {
        let server_event = ServerEvent::new(event, payload);
        let send_failed = {
            let sessions = self.sessions.read().expect("fabric lock");
            let Some(session) = sessions.get(session_id) else {
                return false;
            };
            session.tx.try_send(server_event).is_err()
        };
        if send_failed {
            warn!(session_id, "session send failed — closing that session");
            self.disconnect(session_id);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_matching_subscribed_sessions_only() {
        let fabric = Fabric::new();
        let mut rx_alice = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            Some(vec!["todo_update".to_string()]),
        );
        let mut rx_bob = fabric.connect(
            "calm otter",
            ConnectionKind::Queue,
            Some("bob".to_string()),
            None,
        );

        let reached = fabric.emit_to_user("alice", "todo_update", json!({"id": "j1"}));
        assert_eq!(reached, 1);
        let event = rx_alice.recv().await.unwrap();
        assert_eq!(event.event, "todo_update");
        assert_eq!(event.to_json()["type"], "todo_update");
        assert_eq!(event.to_json()["id"], "j1");
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_event_is_silently_dropped() {
        let fabric = Fabric::new();
        let mut rx = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            Some(vec!["done_update".to_string()]),
        );
        let reached = fabric.emit_to_user("alice", "todo_update", json!({}));
        assert_eq!(reached, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_subscription_receives_everything() {
        let fabric = Fabric::new();
        let mut rx = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );
        fabric.emit_to_user("alice", "anything_at_all", json!({}));
        assert_eq!(rx.recv().await.unwrap().event, "anything_at_all");
    }

    #[tokio::test]
    async fn audio_sessions_are_forced_to_the_whitelist() {
        let fabric = Fabric::new();
        let mut rx = fabric.connect(
            "wise penguin",
            ConnectionKind::Audio,
            Some("alice".to_string()),
            Some(vec!["*".to_string()]),
        );
        assert_eq!(fabric.emit_to_user("alice", "todo_update", json!({})), 0);
        assert_eq!(fabric.emit_to_user("alice", "audio_streaming_complete", json!({})), 1);
        assert_eq!(rx.recv().await.unwrap().event, "audio_streaming_complete");
    }

    #[tokio::test]
    async fn pre_registered_user_binds_on_connect() {
        let fabric = Fabric::new();
        fabric.pre_register_session("wise penguin", "alice");
        let mut rx = fabric.connect("wise penguin", ConnectionKind::Queue, None, None);
        assert_eq!(fabric.session_user("wise penguin").as_deref(), Some("alice"));
        fabric.emit_to_user("alice", "done_update", json!({}));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn late_authentication_binds_user() {
        let fabric = Fabric::new();
        let _rx = fabric.connect("wise penguin", ConnectionKind::Queue, None, None);
        assert!(fabric.session_user("wise penguin").is_none());
        assert!(fabric.authenticate("wise penguin", "alice", Some(vec!["run_update".to_string()])));
        assert_eq!(fabric.session_user("wise penguin").as_deref(), Some("alice"));
        assert_eq!(
            fabric.session_subscriptions("wise penguin").unwrap(),
            vec!["run_update"]
        );
        assert!(!fabric.authenticate("unknown session", "bob", None));
    }

    #[tokio::test]
    async fn subscription_updates_replace_add_remove() {
        let fabric = Fabric::new();
        let _rx = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );

        let subs = fabric
            .update_subscriptions(
                "wise penguin",
                vec!["todo_update".to_string()],
                SubscriptionAction::Replace,
            )
            .unwrap();
        assert_eq!(subs, vec!["todo_update"]);

        let subs = fabric
            .update_subscriptions(
                "wise penguin",
                vec!["done_update".to_string(), "todo_update".to_string()],
                SubscriptionAction::Add,
            )
            .unwrap();
        assert_eq!(subs, vec!["todo_update", "done_update"]);

        let subs = fabric
            .update_subscriptions(
                "wise penguin",
                vec!["todo_update".to_string()],
                SubscriptionAction::Remove,
            )
            .unwrap();
        assert_eq!(subs, vec!["done_update"]);

        assert!(
            fabric
                .update_subscriptions("ghost session", vec![], SubscriptionAction::Replace)
                .is_none()
        );
    }

    #[tokio::test]
    async fn dropped_receiver_closes_only_that_session() {
        let fabric = Fabric::new();
        let rx_dead = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );
        let mut rx_live = fabric.connect(
            "calm otter",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );
        drop(rx_dead);

        let reached = fabric.emit_to_user("alice", "done_update", json!({}));
        assert_eq!(reached, 1);
        assert_eq!(fabric.connected_sessions(), 1);
        assert!(rx_live.recv().await.is_some());
    }

    #[tokio::test]
    async fn per_session_delivery_order_is_preserved() {
        let fabric = Fabric::new();
        let mut rx = fabric.connect(
            "wise penguin",
            ConnectionKind::Queue,
            Some("alice".to_string()),
            None,
        );
        for i in 0..10 {
            fabric.emit_to_user("alice", "run_update", json!({"seq": i}));
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().payload["seq"], i);
        }
    }
}
