#![forbid(unsafe_code)]

// Room error taxonomy and media resource records

use crate::media::{Direction, MediaConsumer, MediaError, MediaKind, MediaProducer, MediaTransport};
use crate::signaling::protocol::ErrorCode;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("transport not found")]
    TransportNotFound,

    #[error("producer not found")]
    ProducerNotFound,

    #[error("consumer not found")]
    ConsumerNotFound,

    #[error("no receive transport")]
    RecvTransportNotFound,

    #[error("cannot consume producer")]
    CantConsume,

    #[error("peer already left the room")]
    PeerGone,

    #[error("room is closed")]
    RoomClosed,

    #[error("room creation failed: {0}")]
    Unavailable(String),

    #[error("room creation timed out")]
    CreationTimedOut,

    #[error("consumer limit of {0} reached")]
    ConsumerLimit(usize),

    #[error("chat message exceeds {0} bytes")]
    MessageTooLong(usize),

    #[error("media engine error: {0}")]
    Engine(#[from] MediaError),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::TransportNotFound => ErrorCode::TransportNotFound,
            RoomError::ProducerNotFound => ErrorCode::ProducerNotFound,
            RoomError::ConsumerNotFound => ErrorCode::ConsumerNotFound,
            RoomError::RecvTransportNotFound => ErrorCode::RecvTransportNotFound,
            RoomError::CantConsume => ErrorCode::CantConsume,
            RoomError::PeerGone => ErrorCode::PeerGone,
            RoomError::RoomClosed | RoomError::Unavailable(_) | RoomError::CreationTimedOut => {
                ErrorCode::RoomUnavailable
            }
            RoomError::ConsumerLimit(_) => ErrorCode::ConsumerLimit,
            RoomError::MessageTooLong(_) => ErrorCode::MessageTooLong,
            RoomError::Engine(MediaError::Incompatible(_)) => ErrorCode::CantConsume,
            RoomError::Engine(MediaError::InvalidParameters(_)) => ErrorCode::InvalidRequest,
            RoomError::Engine(_) => ErrorCode::EngineError,
        }
    }
}

pub type RoomResult<T> = Result<T, RoomError>;

pub struct TransportRecord {
    pub id: String,
    pub owner: String,
    pub direction: Direction,
    pub handle: Arc<dyn MediaTransport>,
}

pub struct ProducerRecord {
    pub id: String,
    pub owner: String,
    pub kind: MediaKind,
    pub transport_id: String,
    pub handle: Arc<dyn MediaProducer>,
}

pub struct ConsumerRecord {
    pub id: String,
    pub owner: String,
    pub producer_id: String,
    pub transport_id: String,
    pub handle: Arc<dyn MediaConsumer>,
}

/// A freshly created consumer, as returned to its owner.
#[derive(Debug, Clone)]
pub struct ConsumerGrant {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
}
