#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::room::{CallKind, RoomRegistry};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_CHAT_LEN: usize = 4096;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(
    sender: &mpsc::Sender<Arc<String>>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", conn_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Clone for the send task
    let conn_id_clone = conn_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", conn_id_clone);
    });

    // The room this connection belongs to — set once on join, never reassigned
    let mut current_room: Option<String> = None;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", conn_id);
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Rate limit exceeded: max {} messages/second", RATE_LIMIT_REFILL_RATE),
                        });
                    }
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = handle_client_message(
                            &client_msg,
                            &conn_id,
                            &mut current_room,
                            &tx,
                            &registry,
                            &metrics,
                        ).await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling message from {}: {}", conn_id, e);
                            metrics.inc_errors();
                            // If channel is closed, send task has exited — break
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(&tx, &ServerMessage::Error {
                                message: format!("Error: {e}"),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", conn_id, e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", conn_id);
            }
        }
    }

    // On disconnect: leave every call this connection was in, notify the
    // remaining room members, and drop room membership.
    if let Some(room_id) = current_room.take() {
        registry.disconnect_member(&room_id, &conn_id).await;
    }

    // _conn_guard dropped here → dec connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for: {}", conn_id);
}

/// Looks up the sender's room. Events that arrive before join-room are
/// silently dropped — no error is surfaced to the client.
fn joined_room<'a>(
    current_room: &'a Option<String>,
    conn_id: &str,
    metrics: &ServerMetrics,
) -> Option<&'a str> {
    match current_room.as_deref() {
        Some(room_id) => Some(room_id),
        None => {
            debug!("Dropping message from {}: no room joined", conn_id);
            metrics.inc_messages_dropped();
            None
        }
    }
}

/// Handle a single client message
async fn handle_client_message(
    message: &ClientMessage,
    conn_id: &str,
    current_room: &mut Option<String>,
    sender: &mpsc::Sender<Arc<String>>,
    registry: &Arc<RoomRegistry>,
    metrics: &ServerMetrics,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::JoinRoom { room } => {
            if room.is_empty() || room.len() > MAX_ROOM_ID_LEN {
                anyhow::bail!("Invalid room id: must be 1-{MAX_ROOM_ID_LEN} characters");
            }
            // A connection's room is set once; a second join is rejected
            // rather than silently re-subscribing.
            if current_room.is_some() {
                anyhow::bail!("Already joined a room");
            }

            registry.add_member(room, conn_id.to_string(), sender.clone()).await;
            *current_room = Some(room.clone());
            metrics.inc_joins();
        }

        ClientMessage::ChatMessage { message } => {
            if message.is_empty() || message.len() > MAX_CHAT_LEN {
                anyhow::bail!("Invalid chat message: must be 1-{MAX_CHAT_LEN} characters");
            }
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_all(room_id, &ServerMessage::ChatMessage {
                    message: message.clone(),
                }).await;
                metrics.inc_chat_messages();
            }
        }

        ClientMessage::VideoOffer { offer } => {
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_except(room_id, conn_id, &ServerMessage::VideoOffer {
                    offer: offer.clone(),
                    from: conn_id.to_string(),
                }).await;
                metrics.inc_signals_relayed();
            }
        }

        ClientMessage::VideoAnswer { answer } => {
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_except(room_id, conn_id, &ServerMessage::VideoAnswer {
                    answer: answer.clone(),
                    from: conn_id.to_string(),
                }).await;
                metrics.inc_signals_relayed();
            }
        }

        ClientMessage::IceCandidate { candidate } => {
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_except(room_id, conn_id, &ServerMessage::IceCandidate {
                    candidate: candidate.clone(),
                    from: conn_id.to_string(),
                }).await;
                metrics.inc_signals_relayed();
            }
        }

        ClientMessage::VideoCallStart => {
            handle_call_start(CallKind::Video, conn_id, current_room, registry, metrics).await;
        }

        ClientMessage::VideoCallEnd => {
            handle_call_end(CallKind::Video, conn_id, current_room, registry, metrics).await;
        }

        ClientMessage::VoiceOffer { offer } => {
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_except(room_id, conn_id, &ServerMessage::VoiceOffer {
                    offer: offer.clone(),
                    from: conn_id.to_string(),
                }).await;
                metrics.inc_signals_relayed();
            }
        }

        ClientMessage::VoiceAnswer { answer } => {
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_except(room_id, conn_id, &ServerMessage::VoiceAnswer {
                    answer: answer.clone(),
                    from: conn_id.to_string(),
                }).await;
                metrics.inc_signals_relayed();
            }
        }

        ClientMessage::VoiceIceCandidate { candidate } => {
            if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
                registry.broadcast_except(room_id, conn_id, &ServerMessage::VoiceIceCandidate {
                    candidate: candidate.clone(),
                    from: conn_id.to_string(),
                }).await;
                metrics.inc_signals_relayed();
            }
        }

        ClientMessage::VoiceCallStart => {
            handle_call_start(CallKind::Voice, conn_id, current_room, registry, metrics).await;
        }

        ClientMessage::VoiceCallEnd => {
            handle_call_end(CallKind::Voice, conn_id, current_room, registry, metrics).await;
        }
    }

    Ok(())
}

/// call-start: record presence, then tell the rest of the room who joined.
async fn handle_call_start(
    kind: CallKind,
    conn_id: &str,
    current_room: &Option<String>,
    registry: &Arc<RoomRegistry>,
    metrics: &ServerMetrics,
) {
    if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
        registry.join_call_presence(room_id, kind, conn_id).await;
        registry.broadcast_except(room_id, conn_id, &ServerMessage::call_joined(kind, conn_id)).await;
        metrics.inc_call_joins();
    }
}

/// call-end: the "left" notification goes out only when the sender was
/// actually present, so peers never see a duplicate.
async fn handle_call_end(
    kind: CallKind,
    conn_id: &str,
    current_room: &Option<String>,
    registry: &Arc<RoomRegistry>,
    metrics: &ServerMetrics,
) {
    if let Some(room_id) = joined_room(current_room, conn_id, metrics) {
        if registry.leave_call_presence(room_id, kind, conn_id).await {
            registry.broadcast_except(room_id, conn_id, &ServerMessage::call_left(kind, conn_id)).await;
            metrics.inc_call_leaves();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// A connection as the dispatch function sees it: id, room slot, and the
    /// outbound channel whose receiver lets tests observe deliveries.
    struct TestConn {
        id: String,
        room: Option<String>,
        tx: mpsc::Sender<Arc<String>>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl TestConn {
        fn new(id: &str) -> Self {
            let (tx, rx) = mpsc::channel(16);
            Self {
                id: id.to_string(),
                room: None,
                tx,
                rx,
            }
        }

        fn recv(&mut self) -> Value {
            let raw = self.rx.try_recv().expect("expected a delivered message");
            serde_json::from_str(&raw).expect("delivered message is JSON")
        }

        fn assert_silent(&mut self) {
            assert!(self.rx.try_recv().is_err(), "expected no delivered message");
        }
    }

    async fn dispatch(
        conn: &mut TestConn,
        registry: &Arc<RoomRegistry>,
        metrics: &ServerMetrics,
        msg: ClientMessage,
    ) -> anyhow::Result<()> {
        let id = conn.id.clone();
        let tx = conn.tx.clone();
        handle_client_message(&msg, &id, &mut conn.room, &tx, registry, metrics).await
    }

    fn setup() -> (Arc<RoomRegistry>, ServerMetrics) {
        let metrics = ServerMetrics::new();
        (Arc::new(RoomRegistry::new(metrics.clone())), metrics)
    }

    async fn join(conn: &mut TestConn, registry: &Arc<RoomRegistry>, metrics: &ServerMetrics, room: &str) {
        dispatch(conn, registry, metrics, ClientMessage::JoinRoom { room: room.to_string() })
            .await
            .expect("join succeeds");
    }

    #[tokio::test]
    async fn test_signaling_before_join_is_dropped() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");

        let result = dispatch(&mut a, &registry, &metrics, ClientMessage::IceCandidate {
            candidate: json!({"sdpMid": "0"}),
        }).await;

        // No crash, no error surfaced, no room joined, nothing delivered
        assert!(result.is_ok());
        assert!(a.room.is_none());
        a.assert_silent();
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_before_join_is_dropped() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");

        let result = dispatch(&mut a, &registry, &metrics, ClientMessage::ChatMessage {
            message: "early".to_string(),
        }).await;

        assert!(result.is_ok());
        a.assert_silent();
    }

    #[tokio::test]
    async fn test_second_join_is_rejected() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");

        join(&mut a, &registry, &metrics, "r1").await;
        let result = dispatch(&mut a, &registry, &metrics, ClientMessage::JoinRoom {
            room: "r2".to_string(),
        }).await;

        assert!(result.is_err());
        // The room is set once — first join wins
        assert_eq!(a.room.as_deref(), Some("r1"));
        assert!(registry.is_member("r1", "a").await);
        assert!(!registry.is_member("r2", "a").await);
    }

    #[tokio::test]
    async fn test_join_validates_room_id() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");

        let result = dispatch(&mut a, &registry, &metrics, ClientMessage::JoinRoom {
            room: String::new(),
        }).await;
        assert!(result.is_err());

        let result = dispatch(&mut a, &registry, &metrics, ClientMessage::JoinRoom {
            room: "r".repeat(MAX_ROOM_ID_LEN + 1),
        }).await;
        assert!(result.is_err());
        assert!(a.room.is_none());
    }

    #[tokio::test]
    async fn test_chat_echoes_to_sender_and_peer() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        dispatch(&mut a, &registry, &metrics, ClientMessage::ChatMessage {
            message: "hello".to_string(),
        }).await.unwrap();

        assert_eq!(a.recv()["message"], "hello");
        assert_eq!(b.recv()["message"], "hello");
    }

    #[tokio::test]
    async fn test_chat_length_is_bounded() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        join(&mut a, &registry, &metrics, "r1").await;

        let result = dispatch(&mut a, &registry, &metrics, ClientMessage::ChatMessage {
            message: "x".repeat(MAX_CHAT_LEN + 1),
        }).await;
        assert!(result.is_err());
        a.assert_silent();
    }

    #[tokio::test]
    async fn test_offer_reaches_only_the_peer() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        dispatch(&mut a, &registry, &metrics, ClientMessage::VideoOffer {
            offer: json!({"sdp": "v=0", "type": "offer"}),
        }).await.unwrap();

        a.assert_silent();
        let delivered = b.recv();
        assert_eq!(delivered["type"], "video-offer");
        assert_eq!(delivered["from"], "a");
        assert_eq!(delivered["offer"]["sdp"], "v=0");
    }

    #[tokio::test]
    async fn test_call_start_records_presence_and_notifies_peer() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        dispatch(&mut a, &registry, &metrics, ClientMessage::VideoCallStart).await.unwrap();

        a.assert_silent();
        let joined = b.recv();
        assert_eq!(joined["type"], "video-call-joined");
        assert_eq!(joined["from"], "a");
        assert!(registry.call_presence_contains("r1", CallKind::Video, "a").await);
        assert!(!registry.call_presence_contains("r1", CallKind::Video, "b").await);
    }

    #[tokio::test]
    async fn test_call_end_without_start_is_silent() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        dispatch(&mut a, &registry, &metrics, ClientMessage::VideoCallEnd).await.unwrap();
        b.assert_silent();
    }

    #[tokio::test]
    async fn test_call_left_sent_exactly_once() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        dispatch(&mut a, &registry, &metrics, ClientMessage::VoiceCallStart).await.unwrap();
        let _ = b.recv(); // voice-call-joined

        dispatch(&mut a, &registry, &metrics, ClientMessage::VoiceCallEnd).await.unwrap();
        dispatch(&mut a, &registry, &metrics, ClientMessage::VoiceCallEnd).await.unwrap();

        let left = b.recv();
        assert_eq!(left["type"], "voice-call-left");
        assert_eq!(left["from"], "a");
        b.assert_silent();
    }

    #[tokio::test]
    async fn test_two_member_call_scenario() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        // A sends chat "hello" → both A and B receive it
        dispatch(&mut a, &registry, &metrics, ClientMessage::ChatMessage {
            message: "hello".to_string(),
        }).await.unwrap();
        assert_eq!(a.recv()["message"], "hello");
        assert_eq!(b.recv()["message"], "hello");

        // A sends video-offer → only B receives it
        dispatch(&mut a, &registry, &metrics, ClientMessage::VideoOffer {
            offer: json!({"type": "offer"}),
        }).await.unwrap();
        a.assert_silent();
        assert_eq!(b.recv()["type"], "video-offer");

        // A starts a video call → B is notified, registry shows presence {A}
        dispatch(&mut a, &registry, &metrics, ClientMessage::VideoCallStart).await.unwrap();
        assert_eq!(b.recv()["type"], "video-call-joined");
        assert!(registry.call_presence_contains("r1", CallKind::Video, "a").await);

        // B answers and joins the call too
        dispatch(&mut b, &registry, &metrics, ClientMessage::VideoCallStart).await.unwrap();
        assert_eq!(a.recv()["type"], "video-call-joined");

        // B disconnects mid-call → A gets video-call-left and B's presence is gone
        let b_room = b.room.take().expect("b joined");
        registry.disconnect_member(&b_room, &b.id).await;

        let left = a.recv();
        assert_eq!(left["type"], "video-call-left");
        assert_eq!(left["from"], "b");
        assert!(!registry.call_presence_contains("r1", CallKind::Video, "b").await);
        assert!(registry.call_presence_contains("r1", CallKind::Video, "a").await);
    }

    #[tokio::test]
    async fn test_video_and_voice_presence_are_independent() {
        let (registry, metrics) = setup();
        let mut a = TestConn::new("a");
        let mut b = TestConn::new("b");
        join(&mut a, &registry, &metrics, "r1").await;
        join(&mut b, &registry, &metrics, "r1").await;

        dispatch(&mut a, &registry, &metrics, ClientMessage::VoiceCallStart).await.unwrap();
        assert_eq!(b.recv()["type"], "voice-call-joined");

        assert!(registry.call_presence_contains("r1", CallKind::Voice, "a").await);
        assert!(registry.call_presence_is_empty("r1", CallKind::Video).await);

        // Ending the voice call leaves video untouched and vice versa
        dispatch(&mut a, &registry, &metrics, ClientMessage::VideoCallEnd).await.unwrap();
        assert!(registry.call_presence_contains("r1", CallKind::Voice, "a").await);
    }
}
