#![forbid(unsafe_code)]

// Room module - per-room media graph, membership and cleanup.
//
// Every read or write of a room's peer/transport/producer/consumer maps happens
// under the room's state mutex. Media engine calls run outside it; their results
// are committed under a fresh acquisition that re-checks the peer is still
// present, so nothing is announced before it is recorded.

pub mod api;
pub mod chat;
pub mod meetings;
pub mod peer;
pub mod registry;
pub mod types;

pub use registry::RoomRegistry;
pub use types::{RoomError, RoomResult};

use crate::auth::types::UserProfile;
use crate::media::{Direction, MediaError, MediaKind, MediaSession, TransportParams};
use crate::signaling::protocol::{EventSender, ParticipantInfo, ProducerInfo, ServerMessage};
use chat::{ChatMessage, Transcript, MAX_MESSAGE_BYTES};
use peer::Peer;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use types::{ConsumerGrant, ConsumerRecord, ProducerRecord, TransportRecord};

/// What the client needs after `joinRoom`
pub struct JoinInfo {
    pub rtp_capabilities: Value,
    pub existing_producers: Vec<ProducerInfo>,
    pub chat_history: Vec<ChatMessage>,
}

/// Result of removing a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// The departing peer was the last one; the room is now closed.
    pub room_emptied: bool,
    pub producers_closed: usize,
}

/// A producer removed by a cascade: (producer id, owning peer id)
type ClosedProducer = (String, String);

struct RoomState {
    peers: HashMap<String, Peer>,
    transports: HashMap<String, TransportRecord>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
    chat: Transcript,
    closed: bool,
}

impl RoomState {
    fn peer(&self, peer_id: &str) -> RoomResult<&Peer> {
        self.peers.get(peer_id).ok_or(RoomError::PeerGone)
    }

    fn broadcast_except(&self, room_id: &str, except_id: &str, message: &ServerMessage) {
        let Some(frame) = message.to_frame() else { return };
        for (id, peer) in &self.peers {
            if id != except_id {
                deliver(room_id, peer, &frame);
            }
        }
    }

    fn broadcast_all(&self, room_id: &str, message: &ServerMessage) {
        let Some(frame) = message.to_frame() else { return };
        for peer in self.peers.values() {
            deliver(room_id, peer, &frame);
        }
    }

    fn announce_closed(&self, room_id: &str, except_id: &str, closed: &[ClosedProducer]) {
        for (producer_id, peer_id) in closed {
            self.broadcast_except(
                room_id,
                except_id,
                &ServerMessage::ProducerClosed {
                    producer_id: producer_id.clone(),
                    peer_id: peer_id.clone(),
                },
            );
        }
    }

    fn teardown_consumer(&mut self, consumer_id: &str) {
        let Some(record) = self.consumers.remove(consumer_id) else { return };
        record.handle.close();
        if let Some(owner) = self.peers.get_mut(&record.owner) {
            owner.consumers.remove(consumer_id);
        }
    }

    /// Closes a producer and every consumer of it, whoever owns them.
    fn teardown_producer(&mut self, producer_id: &str) -> Option<ClosedProducer> {
        let record = self.producers.remove(producer_id)?;
        let dependents: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in dependents {
            self.teardown_consumer(&consumer_id);
        }
        record.handle.close();
        if let Some(owner) = self.peers.get_mut(&record.owner) {
            owner.producers.remove(producer_id);
        }
        Some((record.id, record.owner))
    }

    /// Closes a transport and everything anchored to it.
    fn teardown_transport(&mut self, transport_id: &str) -> Vec<ClosedProducer> {
        let Some(record) = self.transports.remove(transport_id) else {
            return Vec::new();
        };

        let anchored: Vec<String> = self
            .producers
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id.clone())
            .collect();
        let closed: Vec<ClosedProducer> = anchored
            .iter()
            .filter_map(|producer_id| self.teardown_producer(producer_id))
            .collect();

        let consumers: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumers {
            self.teardown_consumer(&consumer_id);
        }

        record.handle.close();
        if let Some(owner) = self.peers.get_mut(&record.owner) {
            owner.clear_transport(transport_id);
        }
        closed
    }

    /// Releases every resource a peer owns: transports (with their cascade),
    /// then producers, then consumers.
    fn teardown_peer(&mut self, peer_id: &str) -> Vec<ClosedProducer> {
        let Some(peer) = self.peers.get(peer_id) else {
            return Vec::new();
        };
        let transports = peer.transports();

        let mut closed = Vec::new();
        for transport_id in transports {
            closed.extend(self.teardown_transport(&transport_id));
        }

        let producers: Vec<String> = self
            .producers
            .values()
            .filter(|p| p.owner == peer_id)
            .map(|p| p.id.clone())
            .collect();
        closed.extend(producers.iter().filter_map(|id| self.teardown_producer(id)));

        let consumers: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.owner == peer_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumers {
            self.teardown_consumer(&consumer_id);
        }
        closed
    }

    fn teardown_all(&mut self) {
        let ids: Vec<String> = self.transports.keys().cloned().collect();
        for id in ids {
            self.teardown_transport(&id);
        }
        let ids: Vec<String> = self.producers.keys().cloned().collect();
        for id in ids {
            self.teardown_producer(&id);
        }
        let ids: Vec<String> = self.consumers.keys().cloned().collect();
        for id in ids {
            self.teardown_consumer(&id);
        }
    }
}

fn deliver(room_id: &str, peer: &Peer, frame: &Arc<String>) {
    match peer.sender.try_send(Arc::clone(frame)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for peer {} in room {}, dropping message", peer.id, room_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for peer {} in room {} (disconnected)", peer.id, room_id);
        }
    }
}

/// Room state: one media session, its peers, their media graph and the chat transcript.
pub struct Room {
    pub id: String,
    session: Arc<dyn MediaSession>,
    state: TokioMutex<RoomState>,
    closed: AtomicBool,
    participants: AtomicUsize,
    max_consumers_per_peer: usize,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(
        id: String,
        session: Arc<dyn MediaSession>,
        chat_limit: usize,
        max_consumers_per_peer: usize,
    ) -> Self {
        Self {
            id,
            session,
            state: TokioMutex::new(RoomState {
                peers: HashMap::new(),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                chat: Transcript::new(chat_limit),
                closed: false,
            }),
            closed: AtomicBool::new(false),
            participants: AtomicUsize::new(0),
            max_consumers_per_peer,
        }
    }

    /// Once closed, a room never accepts peers again.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.load(Ordering::SeqCst)
    }

    fn mark_closed(&self, state: &mut RoomState) {
        state.closed = true;
        self.closed.store(true, Ordering::SeqCst);
        state.teardown_all();
        self.session.close();
    }

    /// Registers a peer and returns the other members at that instant.
    pub async fn admit(
        &self,
        peer_id: &str,
        user: UserProfile,
        sender: EventSender,
    ) -> RoomResult<Vec<ParticipantInfo>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::RoomClosed);
        }

        let others: Vec<ParticipantInfo> = state.peers.values().map(Peer::info).collect();
        let peer = Peer::new(peer_id.to_string(), user, sender);
        let announcement = ServerMessage::ParticipantJoined(peer.info());
        state.peers.insert(peer_id.to_string(), peer);
        self.participants.store(state.peers.len(), Ordering::SeqCst);
        state.broadcast_except(&self.id, peer_id, &announcement);

        info!("Peer {} admitted to room {} ({} others present)", peer_id, self.id, others.len());
        Ok(others)
    }

    pub async fn join_info(&self, peer_id: &str) -> RoomResult<JoinInfo> {
        let state = self.state.lock().await;
        state.peer(peer_id)?;

        let existing_producers = state
            .producers
            .values()
            .filter(|p| p.owner != peer_id)
            .filter_map(|p| {
                state.peers.get(&p.owner).map(|owner| ProducerInfo {
                    producer_id: p.id.clone(),
                    peer_id: p.owner.clone(),
                    kind: p.kind,
                    user: owner.user.clone(),
                })
            })
            .collect();

        Ok(JoinInfo {
            rtp_capabilities: self.session.rtp_capabilities(),
            existing_producers,
            chat_history: state.chat.snapshot(),
        })
    }

    /// Allocates a transport for `direction`. A transport already held for that
    /// direction is closed with its cascade before the new one is recorded.
    pub async fn create_transport(
        &self,
        peer_id: &str,
        direction: Direction,
    ) -> RoomResult<(String, TransportParams)> {
        self.state.lock().await.peer(peer_id)?;

        let handle = self.session.create_transport(direction).await?;
        let transport_id = handle.id();
        let params = handle.params();

        let mut state = self.state.lock().await;
        if state.closed || !state.peers.contains_key(peer_id) {
            handle.close();
            return Err(RoomError::PeerGone);
        }

        let superseded = state.peer(peer_id)?.transport(direction).cloned();
        if let Some(old_id) = superseded {
            debug!("Peer {} replaces {} transport {} in room {}", peer_id, direction, old_id, self.id);
            let closed = state.teardown_transport(&old_id);
            state.announce_closed(&self.id, peer_id, &closed);
        }

        state.transports.insert(
            transport_id.clone(),
            TransportRecord {
                id: transport_id.clone(),
                owner: peer_id.to_string(),
                direction,
                handle,
            },
        );
        if let Some(peer) = state.peers.get_mut(peer_id) {
            peer.set_transport(direction, transport_id.clone());
        }

        debug!("Created {} transport {} for peer {} in room {}", direction, transport_id, peer_id, self.id);
        Ok((transport_id, params))
    }

    pub async fn connect_transport(&self, peer_id: &str, transport_id: &str, dtls_parameters: Value) -> RoomResult<()> {
        let handle = {
            let state = self.state.lock().await;
            state.peer(peer_id)?;
            state
                .transports
                .get(transport_id)
                .filter(|t| t.owner == peer_id)
                .map(|t| Arc::clone(&t.handle))
                .ok_or(RoomError::TransportNotFound)?
        };

        handle.connect(dtls_parameters).await.map_err(|e| match e {
            MediaError::Closed(_) => RoomError::TransportNotFound,
            other => other.into(),
        })
    }

    /// Creates a producer on the caller's send transport and announces it to the others.
    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> RoomResult<String> {
        let handle = {
            let state = self.state.lock().await;
            state.peer(peer_id)?;
            state
                .transports
                .get(transport_id)
                .filter(|t| t.owner == peer_id && t.direction == Direction::Send)
                .map(|t| Arc::clone(&t.handle))
                .ok_or(RoomError::TransportNotFound)?
        };

        let producer = handle.produce(kind, rtp_parameters).await.map_err(|e| match e {
            MediaError::Closed(_) => RoomError::TransportNotFound,
            other => other.into(),
        })?;
        let producer_id = producer.id();

        let mut state = self.state.lock().await;
        if state.closed || !state.peers.contains_key(peer_id) {
            producer.close();
            return Err(RoomError::PeerGone);
        }
        if !state.transports.contains_key(transport_id) {
            producer.close();
            return Err(RoomError::TransportNotFound);
        }

        state.producers.insert(
            producer_id.clone(),
            ProducerRecord {
                id: producer_id.clone(),
                owner: peer_id.to_string(),
                kind,
                transport_id: transport_id.to_string(),
                handle: producer,
            },
        );
        let peer = state.peers.get_mut(peer_id).ok_or(RoomError::PeerGone)?;
        peer.producers.insert(producer_id.clone());
        let announcement = ServerMessage::NewProducer(ProducerInfo {
            producer_id: producer_id.clone(),
            peer_id: peer_id.to_string(),
            kind,
            user: peer.user.clone(),
        });
        state.broadcast_except(&self.id, peer_id, &announcement);

        info!("Peer {} produces {} ({}) in room {}", peer_id, kind, producer_id, self.id);
        Ok(producer_id)
    }

    /// Creates a paused consumer of another peer's producer on the caller's receive transport.
    pub async fn consume(&self, peer_id: &str, producer_id: &str, rtp_capabilities: Value) -> RoomResult<ConsumerGrant> {
        let (transport_id, handle) = {
            let state = self.state.lock().await;
            let peer = state.peer(peer_id)?;
            let producer = state.producers.get(producer_id).ok_or(RoomError::ProducerNotFound)?;
            if producer.owner == peer_id || !self.session.can_consume(producer_id, &rtp_capabilities) {
                return Err(RoomError::CantConsume);
            }
            let transport_id = peer.recv_transport.clone().ok_or(RoomError::RecvTransportNotFound)?;
            let handle = state
                .transports
                .get(&transport_id)
                .map(|t| Arc::clone(&t.handle))
                .ok_or(RoomError::RecvTransportNotFound)?;
            if peer.consumers.len() >= self.max_consumers_per_peer {
                return Err(RoomError::ConsumerLimit(self.max_consumers_per_peer));
            }
            (transport_id, handle)
        };

        let consumer = handle.consume(producer_id, rtp_capabilities).await.map_err(|e| match e {
            MediaError::Closed(_) => RoomError::RecvTransportNotFound,
            other => other.into(),
        })?;

        let mut state = self.state.lock().await;
        let failure = if state.closed || !state.peers.contains_key(peer_id) {
            Some(RoomError::PeerGone)
        } else if !state.transports.contains_key(&transport_id) {
            Some(RoomError::RecvTransportNotFound)
        } else if !state.producers.contains_key(producer_id) {
            Some(RoomError::ProducerNotFound)
        } else {
            None
        };
        if let Some(err) = failure {
            consumer.close();
            return Err(err);
        }

        let grant = ConsumerGrant {
            id: consumer.id(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        state.consumers.insert(
            grant.id.clone(),
            ConsumerRecord {
                id: grant.id.clone(),
                owner: peer_id.to_string(),
                producer_id: producer_id.to_string(),
                transport_id,
                handle: consumer,
            },
        );
        if let Some(peer) = state.peers.get_mut(peer_id) {
            peer.consumers.insert(grant.id.clone());
        }

        debug!("Peer {} consumes producer {} via {} in room {}", peer_id, producer_id, grant.id, self.id);
        Ok(grant)
    }

    pub async fn resume_consumer(&self, peer_id: &str, consumer_id: &str) -> RoomResult<()> {
        let handle = {
            let state = self.state.lock().await;
            state.peer(peer_id)?;
            state
                .consumers
                .get(consumer_id)
                .filter(|c| c.owner == peer_id)
                .map(|c| Arc::clone(&c.handle))
                .ok_or(RoomError::ConsumerNotFound)?
        };

        handle.resume().await.map_err(|e| match e {
            MediaError::Closed(_) => RoomError::ConsumerNotFound,
            other => other.into(),
        })
    }

    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> RoomResult<()> {
        let mut state = self.state.lock().await;
        state.peer(peer_id)?;
        if !state.producers.get(producer_id).is_some_and(|p| p.owner == peer_id) {
            return Err(RoomError::ProducerNotFound);
        }
        let closed: Vec<ClosedProducer> = state.teardown_producer(producer_id).into_iter().collect();
        state.announce_closed(&self.id, peer_id, &closed);
        debug!("Peer {} closed producer {} in room {}", peer_id, producer_id, self.id);
        Ok(())
    }

    pub async fn close_transport(&self, peer_id: &str, transport_id: &str) -> RoomResult<()> {
        let mut state = self.state.lock().await;
        state.peer(peer_id)?;
        if !state.transports.get(transport_id).is_some_and(|t| t.owner == peer_id) {
            return Err(RoomError::TransportNotFound);
        }
        let closed = state.teardown_transport(transport_id);
        state.announce_closed(&self.id, peer_id, &closed);
        debug!("Peer {} closed transport {} in room {}", peer_id, transport_id, self.id);
        Ok(())
    }

    /// Appends a chat message and delivers it to every peer, sender included.
    /// Returns `false` when the text is blank after trimming.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> RoomResult<bool> {
        let text = text.trim();
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(RoomError::MessageTooLong(MAX_MESSAGE_BYTES));
        }

        let mut state = self.state.lock().await;
        let sender = state.peer(peer_id)?.user.clone();
        if text.is_empty() {
            return Ok(false);
        }

        let message = ChatMessage::new(text.to_string(), sender);
        state.chat.append(message.clone());
        state.broadcast_all(&self.id, &ServerMessage::ChatNewMessage { message });
        Ok(true)
    }

    /// Removes a peer and releases everything it owns. Returns `None` if the
    /// peer was already removed, so concurrent disconnect signals run this once.
    pub async fn cleanup(&self, peer_id: &str) -> Option<CleanupOutcome> {
        let mut state = self.state.lock().await;
        if !state.peers.contains_key(peer_id) {
            return None;
        }

        let closed = state.teardown_peer(peer_id);
        state.peers.remove(peer_id);
        self.participants.store(state.peers.len(), Ordering::SeqCst);

        state.announce_closed(&self.id, peer_id, &closed);
        state.broadcast_all(&self.id, &ServerMessage::ParticipantLeft { id: peer_id.to_string() });

        let room_emptied = state.peers.is_empty();
        if room_emptied {
            self.mark_closed(&mut state);
        }

        info!("Peer {} left room {} ({} producers closed)", peer_id, self.id, closed.len());
        Some(CleanupOutcome {
            room_emptied,
            producers_closed: closed.len(),
        })
    }

    /// Closes the room if nobody is in it. Returns whether it is now closed.
    pub async fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return true;
        }
        if !state.peers.is_empty() {
            return false;
        }
        self.mark_closed(&mut state);
        true
    }

    /// Tears everything down regardless of membership.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            self.mark_closed(&mut state);
        }
    }
}
