#![forbid(unsafe_code)]

// Signaling request handler - maps one admitted peer's requests onto room operations

use super::protocol::{Request, Response};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{CleanupOutcome, Room, RoomRegistry, RoomResult};
use std::sync::Arc;
use tracing::debug;

/// An admitted peer's view of its room. Created after successful admission
/// and dropped when the connection ends.
pub struct PeerSession {
    room: Arc<Room>,
    registry: Arc<RoomRegistry>,
    peer_id: String,
    metrics: ServerMetrics,
}

impl PeerSession {
    pub fn new(room: Arc<Room>, registry: Arc<RoomRegistry>, peer_id: String, metrics: ServerMetrics) -> Self {
        Self {
            room,
            registry,
            peer_id,
            metrics,
        }
    }

    /// Executes a single request. Errors are for the caller only.
    pub async fn handle(&self, request: Request) -> RoomResult<Response> {
        let room = &self.room;
        let peer_id = self.peer_id.as_str();

        match request {
            Request::JoinRoom => {
                let info = room.join_info(peer_id).await?;
                Ok(Response::Joined {
                    rtp_capabilities: info.rtp_capabilities,
                    existing_producers: info.existing_producers,
                    chat_history: info.chat_history,
                })
            }

            Request::CreateTransport { direction } => {
                let (id, params) = room.create_transport(peer_id, direction).await?;
                Ok(Response::TransportCreated {
                    id,
                    direction,
                    ice_parameters: params.ice_parameters,
                    ice_candidates: params.ice_candidates,
                    dtls_parameters: params.dtls_parameters,
                })
            }

            Request::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                room.connect_transport(peer_id, &transport_id, dtls_parameters).await?;
                Ok(Response::Connected { connected: true })
            }

            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let id = room.produce(peer_id, &transport_id, kind, rtp_parameters).await?;
                self.metrics.inc(Counter::ProducersCreated);
                Ok(Response::Produced { id })
            }

            Request::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let grant = room.consume(peer_id, &producer_id, rtp_capabilities).await?;
                self.metrics.inc(Counter::ConsumersCreated);
                Ok(Response::Consumed {
                    id: grant.id,
                    producer_id: grant.producer_id,
                    kind: grant.kind,
                    rtp_parameters: grant.rtp_parameters,
                })
            }

            Request::ResumeConsumer { consumer_id } => {
                room.resume_consumer(peer_id, &consumer_id).await?;
                Ok(Response::Resumed { resumed: true })
            }

            Request::CloseProducer { producer_id } => {
                room.close_producer(peer_id, &producer_id).await?;
                Ok(Response::Closed { closed: true })
            }

            Request::CloseTransport { transport_id } => {
                room.close_transport(peer_id, &transport_id).await?;
                Ok(Response::Closed { closed: true })
            }

            Request::SendMessage { text } => {
                let delivered = room.send_message(peer_id, &text).await?;
                if delivered {
                    self.metrics.inc(Counter::ChatMessages);
                }
                Ok(Response::Delivered { delivered })
            }

            Request::LeaveRoom => {
                if self.leave().await.is_none() {
                    debug!("Peer {} already left room {}", peer_id, room.id);
                }
                Ok(Response::Left { left: true })
            }
        }
    }

    /// Runs cleanup for this peer. Safe to call more than once; only the first call does anything.
    pub async fn leave(&self) -> Option<CleanupOutcome> {
        self.registry.depart(&self.room, &self.peer_id).await
    }
}
