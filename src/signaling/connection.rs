#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::handler::PeerSession;
use super::protocol::{ClientEnvelope, ErrorCode, EventSender, Request, ServerMessage};
use crate::auth::types::UserProfile;
use crate::metrics::{Counter, ServerMetrics};
use crate::room::RoomRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outbound queue per client. Frames beyond this are dropped with a warning.
const CHANNEL_CAPACITY: usize = 256;

/// Parsed requests waiting for the peer's request worker.
const REQUEST_QUEUE_CAPACITY: usize = RATE_LIMIT_MAX_TOKENS as usize;

/// How long a disconnected peer's in-flight request may keep running.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Close the connection if nothing is received within this duration.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// What the HTTP layer verified before upgrading.
#[derive(Debug, Clone)]
pub struct Admission {
    pub room_id: String,
    pub user: UserProfile,
}

struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            true
        } else {
            false
        }
    }
}

/// Queues a message for the client without waiting on a slow socket.
fn send_message(sender: &EventSender, peer_id: &str, msg: &ServerMessage) {
    let Some(frame) = msg.to_frame() else { return };
    match sender.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for peer {}, dropping reply", peer_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for peer {}", peer_id);
        }
    }
}

/// Best-effort `requestId` from a frame that failed to parse as a request.
fn recover_request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("requestId")?
        .as_u64()
}

/// Handles one peer's requests in arrival order, off the socket reader so a
/// disconnect is seen while a request is still running. Returns after
/// `leaveRoom` or once the reader stops feeding it.
async fn run_requests(
    session: Arc<PeerSession>,
    mut requests: mpsc::Receiver<ClientEnvelope>,
    tx: EventSender,
    peer_id: String,
    metrics: ServerMetrics,
) {
    while let Some(envelope) = requests.recv().await {
        let request_id = envelope.request_id;
        let name = envelope.request.name();
        let leaving = matches!(envelope.request, Request::LeaveRoom);

        let start = Instant::now();
        let result = session.handle(envelope.request).await;
        metrics.observe_request_handling(start.elapsed());

        let reply = match result {
            Ok(data) => ServerMessage::response(request_id, data),
            Err(e) => {
                debug!("{} from peer {} failed: {}", name, peer_id, e);
                metrics.inc(Counter::RequestErrors);
                ServerMessage::error(Some(request_id), e.code())
            }
        };
        send_message(&tx, &peer_id, &reply);

        if leaving {
            info!("Peer {} left its room", peer_id);
            return;
        }
    }
}

/// Handles a single WebSocket connection from admission to cleanup.
pub async fn handle_connection(
    socket: WebSocket,
    admission: Admission,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    let Admission { room_id, user } = admission;
    info!("New WebSocket connection: {} ({}) for room {}", peer_id, user.email, room_id);

    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Room events queue up in `rx` until the admission reply has been written,
    // so `roomJoined` is always the first frame the client sees.
    let (room, participants) = match registry.admit(&room_id, &peer_id, user, tx.clone()).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!("Admission of {} to room {} failed: {}", peer_id, room_id, e);
            metrics.inc(Counter::AdmissionsRejected);
            let reply = ServerMessage::RoomError {
                message: e.to_string(),
            };
            if let Some(frame) = reply.to_frame() {
                let _ = ws_sender.send(Message::Text((*frame).clone())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    let session = Arc::new(PeerSession::new(
        room,
        Arc::clone(&registry),
        peer_id.clone(),
        metrics.clone(),
    ));

    let joined = ServerMessage::RoomJoined {
        room_id: room_id.clone(),
        self_id: peer_id.clone(),
        participants,
    };
    if let Some(frame) = joined.to_frame() {
        if ws_sender.send(Message::Text((*frame).clone())).await.is_err() {
            debug!("Peer {} went away during admission", peer_id);
            session.leave().await;
            return;
        }
        metrics.inc(Counter::MessagesSent);
    }

    let send_peer_id = peer_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text((*json).clone())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task finished for peer: {}", send_peer_id);
    });

    let (requests_tx, requests_rx) = mpsc::channel::<ClientEnvelope>(REQUEST_QUEUE_CAPACITY);
    let mut worker = tokio::spawn(run_requests(
        Arc::clone(&session),
        requests_rx,
        tx.clone(),
        peer_id.clone(),
        metrics.clone(),
    ));
    let mut worker_done = false;

    let mut limiter = RateLimiter::new(Instant::now());
    let mut rate_limit_warned = false;

    loop {
        let next = tokio::select! {
            _ = &mut worker => {
                // The worker only finishes on its own after leaveRoom.
                worker_done = true;
                break;
            }
            next = tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()) => next,
        };
        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                if limiter.try_acquire(Instant::now()) {
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for peer {}", peer_id);
                        send_message(
                            &tx,
                            &peer_id,
                            &ServerMessage::error(recover_request_id(&text), ErrorCode::RateLimited),
                        );
                    }
                    continue;
                }

                let envelope = match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", peer_id, e);
                        metrics.inc(Counter::RequestErrors);
                        send_message(
                            &tx,
                            &peer_id,
                            &ServerMessage::error(recover_request_id(&text), ErrorCode::InvalidRequest),
                        );
                        continue;
                    }
                };

                match requests_tx.try_send(envelope) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(envelope)) => {
                        warn!("Request queue full for peer {}", peer_id);
                        send_message(
                            &tx,
                            &peer_id,
                            &ServerMessage::error(Some(envelope.request_id), ErrorCode::RateLimited),
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!("Unexpected binary frame from peer {}", peer_id);
                send_message(&tx, &peer_id, &ServerMessage::error(None, ErrorCode::InvalidRequest));
            }
        }
    }

    // Runs once even if the peer already sent leaveRoom. A request still in
    // flight finds the peer gone when it commits and releases what it made.
    session.leave().await;
    drop(requests_tx);

    if !worker_done && tokio::time::timeout(DRAIN_TIMEOUT, &mut worker).await.is_err() {
        warn!("Request from peer {} still running after disconnect, aborting it", peer_id);
        worker.abort();
    }

    drop(session);
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for peer: {}", peer_id);
}
