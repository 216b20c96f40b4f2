#![forbid(unsafe_code)]

// In-memory media engine for room and signaling tests. Every handle it hands
// out is recorded so tests can assert which ones were closed.

use crate::media::types::{Direction, MediaError, MediaKind, MediaResult, TransportParams};
use crate::media::{MediaConsumer, MediaEngine, MediaProducer, MediaSession, MediaTransport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Notify;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Receive capabilities that the fake engine accepts.
pub fn compatible_caps() -> Value {
    json!({ "codecs": [{ "mimeType": "audio/opus" }, { "mimeType": "video/VP8" }] })
}

/// Receive capabilities that the fake engine rejects for every producer.
pub fn incompatible_caps() -> Value {
    json!({ "codecs": [], "incompatible": true })
}

#[derive(Default)]
struct Shared {
    sessions: StdMutex<Vec<Arc<FakeSession>>>,
    transports: StdMutex<Vec<Arc<FakeTransport>>>,
    producers: StdMutex<Vec<Arc<FakeProducer>>>,
    consumers: StdMutex<Vec<Arc<FakeConsumer>>>,
    fail_sessions: AtomicBool,
    stall_sessions: AtomicBool,
    transport_gate: StdMutex<Option<Arc<Notify>>>,
    held_transports: AtomicUsize,
}

impl Shared {
    fn producer(&self, id: &str) -> Option<Arc<FakeProducer>> {
        self.producers.lock().unwrap().iter().find(|p| p.id == id).cloned()
    }
}

#[derive(Default)]
pub struct FakeEngine {
    shared: Arc<Shared>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.shared.fail_sessions.store(fail, Ordering::SeqCst);
    }

    /// Session creation never completes while set.
    pub fn stall_sessions(&self, stall: bool) {
        self.shared.stall_sessions.store(stall, Ordering::SeqCst);
    }

    /// Holds each subsequent `create_transport` until the returned notify is signalled once per call.
    pub fn hold_transports(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.shared.transport_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Transport creations currently parked on the gate.
    pub fn held_transports(&self) -> usize {
        self.shared.held_transports.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.shared.sessions.lock().unwrap().clone()
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.shared.transports.lock().unwrap().clone()
    }

    pub fn transport(&self, id: &str) -> Option<Arc<FakeTransport>> {
        self.transports().into_iter().find(|t| t.id == id)
    }

    pub fn producer(&self, id: &str) -> Option<Arc<FakeProducer>> {
        self.shared.producer(id)
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.shared.consumers.lock().unwrap().clone()
    }

    pub fn consumer(&self, id: &str) -> Option<Arc<FakeConsumer>> {
        self.consumers().into_iter().find(|c| c.id == id)
    }

    /// Count of handles of every kind that are still open.
    pub fn open_handles(&self) -> usize {
        let transports = self.transports().iter().filter(|t| !t.is_closed()).count();
        let producers = self
            .shared
            .producers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_closed())
            .count();
        let consumers = self.consumers().iter().filter(|c| !c.is_closed()).count();
        transports + producers + consumers
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_session(&self, _room_id: &str) -> MediaResult<Arc<dyn MediaSession>> {
        if self.shared.stall_sessions.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.shared.fail_sessions.load(Ordering::SeqCst) {
            return Err(MediaError::RouterError("fake engine refused".to_string()));
        }
        let session = Arc::new(FakeSession {
            id: new_id(),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        });
        self.shared.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    async fn shutdown(&self) {
        for session in self.sessions() {
            session.close();
        }
    }
}

pub struct FakeSession {
    pub id: String,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl FakeSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    fn rtp_capabilities(&self) -> Value {
        compatible_caps()
    }

    async fn create_transport(&self, direction: Direction) -> MediaResult<Arc<dyn MediaTransport>> {
        let gate = self.shared.transport_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.shared.held_transports.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            self.shared.held_transports.fetch_sub(1, Ordering::SeqCst);
        }
        if self.is_closed() {
            return Err(MediaError::Closed(format!("session {}", self.id)));
        }
        let transport = Arc::new(FakeTransport {
            id: new_id(),
            direction,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        });
        self.shared.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        if rtp_capabilities.get("incompatible").and_then(Value::as_bool) == Some(true) {
            return false;
        }
        self.shared.producer(producer_id).is_some_and(|p| !p.is_closed())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    pub id: String,
    pub direction: Direction,
    connected: AtomicBool,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl FakeTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn params(&self) -> TransportParams {
        TransportParams {
            ice_parameters: json!({ "usernameFragment": self.id, "password": "fake" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        }
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        self.ensure_open()?;
        if !dtls_parameters.is_object() {
            return Err(MediaError::InvalidParameters("dtlsParameters".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, _rtp_parameters: Value) -> MediaResult<Arc<dyn MediaProducer>> {
        self.ensure_open()?;
        let producer = Arc::new(FakeProducer {
            id: new_id(),
            kind,
            closed: AtomicBool::new(false),
        });
        self.shared.producers.lock().unwrap().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(&self, producer_id: &str, _rtp_capabilities: Value) -> MediaResult<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        let producer = self
            .shared
            .producer(producer_id)
            .filter(|p| !p.is_closed())
            .ok_or_else(|| MediaError::ConsumerError(format!("producer {producer_id} gone")))?;
        let consumer = Arc::new(FakeConsumer {
            id: new_id(),
            kind: producer.kind,
            producer_id: producer_id.to_string(),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.shared.consumers.lock().unwrap().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeProducer {
    pub id: String,
    pub kind: MediaKind,
    closed: AtomicBool,
}

impl FakeProducer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MediaProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConsumer {
    pub id: String,
    pub kind: MediaKind,
    pub producer_id: String,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl FakeConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        json!({ "codecs": [], "encodings": [{ "ssrc": 1111 }] })
    }

    async fn resume(&self) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
