// Real-time push fabric: session registry, delivery rooms, audience-filtered
// fan-out, and a bounded offline queue per user.
//
// Fan-out is synchronous over unbounded per-session channels, so services
// can publish without awaiting; the socket tasks drain at their own pace.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::error::ok;
use crate::http::AppState;
use crate::metrics::Metrics;

/// Keep-alive ping cadence. Under the 30 s idle timeout so a healthy but
/// quiet client is never reaped.
const KEEPALIVE_INTERVAL_SECS: u64 = 25;
const IDLE_TIMEOUT_SECS: u64 = 30;

/// Per-user offline queue bound; overflow drops the oldest event.
const OFFLINE_QUEUE_CAP: usize = 50;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Audience {
    #[serde(rename = "deliveryId", skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(rename = "userIds", default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
}

impl Audience {
    pub fn delivery(delivery_id: &str) -> Self {
        Self {
            delivery_id: Some(delivery_id.to_string()),
            ..Self::default()
        }
    }

    pub fn users(user_ids: Vec<String>) -> Self {
        Self {
            user_ids,
            ..Self::default()
        }
    }

    pub fn roles(roles: Vec<Role>) -> Self {
        Self {
            roles,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "eventId")]
    pub event_id: String,
    pub name: String,
    pub payload: Value,
    pub audience: Audience,
    pub at: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(name: &str, payload: Value, audience: Audience) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            payload,
            audience,
            at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "event")]
    Event { event: RealtimeEvent },
    #[serde(rename = "authenticated")]
    Authenticated { success: bool },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate {
        #[serde(rename = "userId")]
        user_id: String,
        role: Role,
    },
    #[serde(rename = "subscribe:delivery")]
    SubscribeDelivery {
        #[serde(rename = "deliveryId")]
        delivery_id: String,
    },
    #[serde(rename = "unsubscribe:delivery")]
    UnsubscribeDelivery {
        #[serde(rename = "deliveryId")]
        delivery_id: String,
    },
    #[serde(rename = "ping")]
    Ping,
}

struct Session {
    tx: mpsc::UnboundedSender<ServerMessage>,
    identity: Option<(String, Role)>,
}

pub struct Broadcaster {
    sessions: DashMap<String, Session>,
    rooms: DashMap<String, HashSet<String>>,
    offline: DashMap<String, VecDeque<RealtimeEvent>>,
    metrics: Arc<Metrics>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            offline: DashMap::new(),
            metrics,
        }
    }

    pub fn register(&self, session_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.sessions.insert(
            session_id.to_string(),
            Session { tx, identity: None },
        );
    }

    /// Binds the session to an identity, acks, then drains the user's
    /// offline queue in enqueue order.
    pub fn authenticate(&self, session_id: &str, user_id: &str, role: Role) {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return;
        };
        session.identity = Some((user_id.to_string(), role));
        let drained = self
            .offline
            .remove(user_id)
            .map(|(_, queue)| queue)
            .unwrap_or_default();
        let _ = session.tx.send(ServerMessage::Authenticated { success: true });
        let backlog = drained.len();
        for event in drained {
            if session.tx.send(ServerMessage::Event { event }).is_ok() {
                Metrics::bump(&self.metrics.events_delivered);
            }
        }
        if backlog > 0 {
            info!(user = user_id, backlog, "offline_queue_drained");
        }
    }

    pub fn subscribe(&self, session_id: &str, delivery_id: &str) {
        self.rooms
            .entry(delivery_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn unsubscribe(&self, session_id: &str, delivery_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(delivery_id) {
            members.remove(session_id);
        }
    }

    /// Drops the session from every index. Other state is untouched.
    pub fn disconnect(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.rooms.retain(|_, members| {
            members.remove(session_id);
            !members.is_empty()
        });
    }

    /// Audience-filtered fan-out. A session satisfying several criteria
    /// still receives the event once per broadcast call.
    pub fn broadcast(&self, event: RealtimeEvent) -> usize {
        let mut targets: HashSet<String> = HashSet::new();

        if let Some(delivery_id) = &event.audience.delivery_id {
            if let Some(members) = self.rooms.get(delivery_id) {
                targets.extend(members.iter().cloned());
            }
        }

        if !event.audience.roles.is_empty() {
            for entry in self.sessions.iter() {
                if let Some((_, role)) = &entry.value().identity {
                    if event.audience.roles.contains(role) {
                        targets.insert(entry.key().clone());
                    }
                }
            }
        }

        for user_id in &event.audience.user_ids {
            let live: Vec<String> = self
                .sessions
                .iter()
                .filter(|e| {
                    e.value()
                        .identity
                        .as_ref()
                        .is_some_and(|(uid, _)| uid == user_id)
                })
                .map(|e| e.key().clone())
                .collect();
            if live.is_empty() {
                self.enqueue_offline(user_id, event.clone());
            } else {
                targets.extend(live);
            }
        }

        let mut delivered = 0;
        for session_id in targets {
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };
            if session
                .tx
                .send(ServerMessage::Event { event: event.clone() })
                .is_err()
            {
                // The socket died mid-broadcast; an already-initiated send
                // for a known user is preserved, not lost.
                if let Some((user_id, _)) = &session.identity {
                    self.enqueue_offline(user_id, event.clone());
                }
            } else {
                delivered += 1;
                Metrics::bump(&self.metrics.events_delivered);
            }
        }
        delivered
    }

    fn enqueue_offline(&self, user_id: &str, event: RealtimeEvent) {
        let mut queue = self.offline.entry(user_id.to_string()).or_default();
        if queue.len() >= OFFLINE_QUEUE_CAP {
            if let Some(dropped) = queue.pop_front() {
                Metrics::bump(&self.metrics.offline_queue_drops);
                warn!(
                    user = user_id,
                    dropped_event = %dropped.event_id,
                    "offline_queue_overflow_drop"
                );
            }
        }
        queue.push_back(event);
        Metrics::bump(&self.metrics.events_queued_offline);
    }

    pub fn stats(&self) -> RealtimeStats {
        let authenticated = self
            .sessions
            .iter()
            .filter(|e| e.value().identity.is_some())
            .count();
        let queued_events = self.offline.iter().map(|e| e.value().len()).sum();
        RealtimeStats {
            sessions: self.sessions.len(),
            authenticated,
            rooms: self.rooms.len(),
            queued_users: self.offline.len(),
            queued_events,
        }
    }

    #[cfg(test)]
    fn offline_len(&self, user_id: &str) -> usize {
        self.offline.get(user_id).map(|q| q.len()).unwrap_or(0)
    }
}

#[derive(Serialize)]
pub struct RealtimeStats {
    pub sessions: usize,
    pub authenticated: usize,
    pub rooms: usize,
    #[serde(rename = "queuedUsers")]
    pub queued_users: usize,
    #[serde(rename = "queuedEvents")]
    pub queued_events: usize,
}

// --- WebSocket protocol ---------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let session_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.realtime.register(&session_id, tx);
    debug!(session = %session_id, "realtime_session_open");

    let mut send_task = tokio::spawn(async move {
        let mut keepalive = interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                outbound = rx.recv() => {
                    let Some(message) = outbound else { break };
                    let Ok(text) = serde_json::to_string(&message) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader_state = state.clone();
    let reader_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let frame = timeout(Duration::from_secs(IDLE_TIMEOUT_SECS), stream.next()).await;
            match frame {
                Err(_) => {
                    debug!(session = %reader_session, "realtime_idle_timeout");
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(Message::Text(text)))) => {
                    handle_client_message(&reader_state, &reader_session, &text);
                }
                // Pings/pongs reset the idle window and need no reply here.
                Ok(Some(Ok(_))) => {}
            }
        }
    });

    // First side to finish tears the other down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.realtime.disconnect(&session_id);
    debug!(session = %session_id, "realtime_session_closed");
}

fn handle_client_message(state: &AppState, session_id: &str, text: &str) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            debug!(session = %session_id, %error, "realtime_bad_message");
            return;
        }
    };
    match parsed {
        ClientMessage::Authenticate { user_id, role } => {
            state.realtime.authenticate(session_id, &user_id, role);
        }
        ClientMessage::SubscribeDelivery { delivery_id } => {
            state.realtime.subscribe(session_id, &delivery_id);
        }
        ClientMessage::UnsubscribeDelivery { delivery_id } => {
            state.realtime.unsubscribe(session_id, &delivery_id);
        }
        ClientMessage::Ping => {
            if let Some(session) = state.realtime.sessions.get(session_id) {
                let _ = session.tx.send(ServerMessage::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                });
            }
        }
    }
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    ok(state.realtime.stats())
}

async fn health_handler() -> Response {
    ok(json!({"status": "healthy", "service": "realtime"}))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Arc::new(Metrics::new()))
    }

    fn attach(b: &Broadcaster, session_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        b.register(session_id, tx);
        rx
    }

    fn recv_events(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<RealtimeEvent> {
        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::Event { event } = message {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_room_broadcast_reaches_subscribers() {
        let b = broadcaster();
        let mut rx1 = attach(&b, "s1");
        let mut rx2 = attach(&b, "s2");
        b.subscribe("s1", "d1");

        let delivered = b.broadcast(RealtimeEvent::new(
            "delivery:status",
            json!({"status": "out_for_delivery"}),
            Audience::delivery("d1"),
        ));
        assert_eq!(delivered, 1);
        assert_eq!(recv_events(&mut rx1).len(), 1);
        assert!(recv_events(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_audience_delivers_once() {
        let b = broadcaster();
        let mut rx = attach(&b, "s1");
        b.authenticate("s1", "officer-1", Role::SecurityOfficer);
        b.subscribe("s1", "d1");
        // Drain the authenticated ack.
        let _ = rx.try_recv();

        let event = RealtimeEvent::new(
            "alert:security",
            json!({"alert": "a1"}),
            Audience {
                delivery_id: Some("d1".into()),
                user_ids: vec!["officer-1".into()],
                roles: vec![Role::SecurityOfficer],
            },
        );
        let delivered = b.broadcast(event);
        assert_eq!(delivered, 1, "session matched three criteria but gets one copy");
        assert_eq!(recv_events(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_role_broadcast_skips_unauthenticated() {
        let b = broadcaster();
        let mut anon = attach(&b, "s1");
        let mut officer = attach(&b, "s2");
        b.authenticate("s2", "officer-1", Role::SecurityOfficer);
        let _ = officer.try_recv();

        b.broadcast(RealtimeEvent::new(
            "alert:security",
            json!({}),
            Audience::roles(vec![Role::SecurityOfficer, Role::Admin]),
        ));
        assert!(recv_events(&mut anon).is_empty());
        assert_eq!(recv_events(&mut officer).len(), 1);
    }

    #[tokio::test]
    async fn test_offline_queue_bounded_at_50_oldest_dropped() {
        let b = broadcaster();
        for i in 0..51 {
            b.broadcast(RealtimeEvent::new(
                "notification:new",
                json!({"seq": i}),
                Audience::users(vec!["u2".into()]),
            ));
        }
        assert_eq!(b.offline_len("u2"), 50);

        // Authenticate: ack first, then the 50 retained events in order.
        let mut rx = attach(&b, "s1");
        b.authenticate("s1", "u2", Role::Customer);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Authenticated { success: true })));
        let events = recv_events(&mut rx);
        assert_eq!(events.len(), 50);
        assert_eq!(events[0].payload["seq"], 1, "oldest event was dropped");
        assert_eq!(events[49].payload["seq"], 50);
        assert_eq!(b.offline_len("u2"), 0, "queue cleared after drain");
    }

    #[tokio::test]
    async fn test_dead_session_send_falls_back_to_offline_queue() {
        let b = broadcaster();
        let rx = attach(&b, "s1");
        b.authenticate("s1", "driver-9", Role::Driver);
        drop(rx);

        b.broadcast(RealtimeEvent::new(
            "delivery:assigned",
            json!({}),
            Audience::users(vec!["driver-9".into()]),
        ));
        // The session was live but its channel was gone; the event is kept.
        assert_eq!(b.offline_len("driver-9"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_indices() {
        let b = broadcaster();
        let _rx = attach(&b, "s1");
        b.subscribe("s1", "d1");
        b.disconnect("s1");
        assert_eq!(b.stats().sessions, 0);
        assert_eq!(b.stats().rooms, 0);
    }
}
