#![forbid(unsafe_code)]

// mediasoup-backed media engine. Each handle owns its mediasoup object in an
// Option; closing takes it out and the drop closes it inside the worker.

use crate::media::config::MediaConfig;
use crate::media::types::{Direction, MediaError, MediaKind, MediaResult, TransportParams};
use crate::media::worker_manager::{WorkerLease, WorkerPool};
use crate::media::{MediaConsumer, MediaEngine, MediaProducer, MediaSession, MediaTransport};
use async_trait::async_trait;
use mediasoup::prelude::*;
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info};

impl From<MediaKind> for mediasoup::rtp_parameters::MediaKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
        }
    }
}

impl From<mediasoup::rtp_parameters::MediaKind> for MediaKind {
    fn from(kind: mediasoup::rtp_parameters::MediaKind) -> Self {
        match kind {
            mediasoup::rtp_parameters::MediaKind::Audio => Self::Audio,
            mediasoup::rtp_parameters::MediaKind::Video => Self::Video,
        }
    }
}

fn take_lock<T>(slot: &StdMutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn clone_live<T: Clone>(slot: &StdMutex<Option<T>>, what: &str, id: &str) -> MediaResult<T> {
    slot.lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or_else(|| MediaError::Closed(format!("{what} {id}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Media engine over a mediasoup worker pool.
pub struct SfuEngine {
    pool: WorkerPool,
    config: MediaConfig,
}

impl SfuEngine {
    /// Starts the worker pool.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if a worker cannot be spawned
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        let pool = WorkerPool::new(&config.worker_config).await?;
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl MediaEngine for SfuEngine {
    async fn create_session(&self, room_id: &str) -> MediaResult<Arc<dyn MediaSession>> {
        // Dropping the lease on any early exit, cancellation included, gives the slot back.
        let lease = self.pool.acquire()?;
        let router = lease
            .worker
            .create_router(self.config.router_config.to_router_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        info!(
            "Created router {} for room {} on worker {} ({} routers)",
            router.id(),
            room_id,
            lease.worker.id(),
            lease.load()
        );

        Ok(Arc::new(SfuSession {
            id: router.id().to_string(),
            rtp_capabilities: to_json(&router.rtp_capabilities()),
            router: StdMutex::new(Some(router)),
            lease,
            transport_config: self.config.webrtc_transport_config.to_transport_options(),
        }))
    }

    async fn shutdown(&self) {
        self.pool.shutdown();
    }
}

struct SfuSession {
    id: String,
    rtp_capabilities: Value,
    router: StdMutex<Option<Router>>,
    lease: WorkerLease,
    transport_config: WebRtcTransportOptions,
}

#[async_trait]
impl MediaSession for SfuSession {
    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    async fn create_transport(&self, direction: Direction) -> MediaResult<Arc<dyn MediaTransport>> {
        let router = clone_live(&self.router, "router", &self.id)?;
        let transport = router
            .create_webrtc_transport(self.transport_config.clone())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create {direction} transport: {e}")))?;

        let params = TransportParams {
            ice_parameters: to_json(transport.ice_parameters()),
            ice_candidates: to_json(transport.ice_candidates()),
            dtls_parameters: to_json(&transport.dtls_parameters()),
        };
        debug!("Created {} transport {} on router {}", direction, transport.id(), self.id);

        Ok(Arc::new(SfuTransport {
            id: transport.id().to_string(),
            params,
            inner: StdMutex::new(Some(transport)),
        }))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = clone_live(&self.router, "router", &self.id) else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(caps) => router.can_consume(&producer_id, &caps),
            Err(e) => {
                debug!("Unparseable receive capabilities: {e}");
                false
            }
        }
    }

    fn close(&self) {
        if take_lock(&self.router).is_some() {
            self.lease.release();
            info!("Closed router {}", self.id);
        }
    }
}

struct SfuTransport {
    id: String,
    params: TransportParams,
    inner: StdMutex<Option<WebRtcTransport>>,
}

#[async_trait]
impl MediaTransport for SfuTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let transport = clone_live(&self.inner, "transport", &self.id)?;
        let dtls_parameters: DtlsParameters = serde_json::from_value(dtls_parameters)
            .map_err(|e| MediaError::InvalidParameters(format!("dtlsParameters: {e}")))?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport {}: {e}", self.id)))
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Arc<dyn MediaProducer>> {
        let transport = clone_live(&self.inner, "transport", &self.id)?;
        let rtp_parameters: RtpParameters = serde_json::from_value(rtp_parameters)
            .map_err(|e| MediaError::InvalidParameters(format!("rtpParameters: {e}")))?;
        let producer = transport
            .produce(ProducerOptions::new(kind.into(), rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        debug!("Created {} producer {} on transport {}", kind, producer.id(), self.id);
        Ok(Arc::new(SfuProducer {
            id: producer.id().to_string(),
            inner: StdMutex::new(Some(producer)),
        }))
    }

    async fn consume(&self, producer_id: &str, rtp_capabilities: Value) -> MediaResult<Arc<dyn MediaConsumer>> {
        let transport = clone_live(&self.inner, "transport", &self.id)?;
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::InvalidParameters(format!("producer id {producer_id}")))?;
        let rtp_capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|e| MediaError::InvalidParameters(format!("rtpCapabilities: {e}")))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        debug!("Created consumer {} for producer {} on transport {}", consumer.id(), producer_id, self.id);
        Ok(Arc::new(SfuConsumer {
            id: consumer.id().to_string(),
            kind: consumer.kind().into(),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            inner: StdMutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        if take_lock(&self.inner).is_some() {
            debug!("Closed transport {}", self.id);
        }
    }
}

struct SfuProducer {
    id: String,
    inner: StdMutex<Option<Producer>>,
}

impl MediaProducer for SfuProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn close(&self) {
        if take_lock(&self.inner).is_some() {
            debug!("Closed producer {}", self.id);
        }
    }
}

struct SfuConsumer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    inner: StdMutex<Option<Consumer>>,
}

#[async_trait]
impl MediaConsumer for SfuConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> MediaResult<()> {
        let consumer = clone_live(&self.inner, "consumer", &self.id)?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer {}: {e}", self.id)))
    }

    fn close(&self) {
        if take_lock(&self.inner).is_some() {
            debug!("Closed consumer {}", self.id);
        }
    }
}
