#![forbid(unsafe_code)]

// Media module - the media engine contract and its mediasoup implementation.
// The room core only ever talks to the traits below; negotiation payloads stay
// opaque JSON until they reach the engine.

pub mod config;
pub mod sfu;
pub mod types;
pub mod worker_manager;

#[cfg(test)]
pub mod testing;

pub use config::MediaConfig;
pub use sfu::SfuEngine;
pub use types::{Direction, MediaError, MediaKind, MediaResult, TransportParams};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Allocates routable session contexts, one per room.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Creates a session context with the engine's fixed codec set.
    async fn create_session(&self, room_id: &str) -> MediaResult<Arc<dyn MediaSession>>;

    /// Closes every session and worker.
    async fn shutdown(&self);
}

/// A routable session context (a mediasoup router).
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Router RTP capabilities, handed to clients on join.
    fn rtp_capabilities(&self) -> Value;

    async fn create_transport(&self, direction: Direction) -> MediaResult<Arc<dyn MediaTransport>>;

    /// Whether a consumer with the given receive capabilities could be created for the producer.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    /// Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Arc<dyn MediaProducer>>;

    /// Consumers always start paused.
    async fn consume(&self, producer_id: &str, rtp_capabilities: Value) -> MediaResult<Arc<dyn MediaConsumer>>;

    /// Idempotent.
    fn close(&self);
}

pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;
    fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    async fn resume(&self) -> MediaResult<()>;
    fn close(&self);
}
