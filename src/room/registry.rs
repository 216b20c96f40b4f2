#![forbid(unsafe_code)]

// Session registry - the process-wide map from room id to live Room.
//
// Empty at startup. Entries are added only by `resolve_or_create` (creation is
// serialized per room id) and removed only by `evict`, which runs once the
// room has closed itself on its last departure or after an unused grace window.

use crate::auth::types::UserProfile;
use crate::config::Config;
use crate::media::MediaEngine;
use crate::metrics::{Counter, ServerMetrics};
use crate::room::meetings::{MeetingMeta, MeetingStore};
use crate::room::types::{RoomError, RoomResult};
use crate::room::{CleanupOutcome, Room};
use crate::signaling::protocol::{EventSender, ParticipantInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Attempts at admitting into a room that closes underneath us before giving up.
const ADMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub creation_timeout: Duration,
    pub empty_room_grace: Duration,
    pub chat_history_limit: usize,
    pub max_consumers_per_peer: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            creation_timeout: config.room_create_timeout,
            empty_room_grace: config.empty_room_grace,
            chat_history_limit: config.chat_history_limit,
            max_consumers_per_peer: config.max_consumers_per_peer,
        }
    }
}

pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<Room>>>,
    /// Per-id creation locks; an entry lives while someone is creating or waiting.
    creating: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    engine: Arc<dyn MediaEngine>,
    meetings: MeetingStore,
    metrics: ServerMetrics,
    settings: RegistrySettings,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, metrics: ServerMetrics, settings: RegistrySettings) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            creating: StdMutex::new(HashMap::new()),
            engine,
            meetings: MeetingStore::new(),
            metrics,
            settings,
        }
    }

    pub fn meetings(&self) -> &MeetingStore {
        &self.meetings
    }

    /// Returns the open room registered under `room_id`, if any.
    pub fn lookup(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .filter(|room| !room.is_closed())
            .cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_participant_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|room| room.participant_count())
            .sum()
    }

    /// Returns the room for `room_id`, creating it (and its media session) if
    /// needed. Concurrent callers for the same unknown id share one creation.
    /// On failure nothing is registered.
    ///
    /// The creation timeout is one deadline per caller, covering both the wait
    /// behind another caller's creation and this caller's own attempt.
    pub async fn resolve_or_create(&self, room_id: &str) -> RoomResult<Arc<Room>> {
        if let Some(room) = self.lookup(room_id) {
            return Ok(room);
        }

        let deadline = Instant::now() + self.settings.creation_timeout;
        let creation_lock = {
            let mut creating = self.creating.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(creating.entry(room_id.to_string()).or_default())
        };

        let result = match tokio::time::timeout_at(deadline, creation_lock.lock()).await {
            Ok(guard) => {
                let result = match self.lookup(room_id) {
                    Some(room) => Ok(room),
                    None => self.create_room(room_id, deadline).await,
                };
                drop(guard);
                result
            }
            Err(_) => {
                warn!("Gave up waiting on creation of room {} after {:?}", room_id, self.settings.creation_timeout);
                Err(RoomError::CreationTimedOut)
            }
        };

        {
            let mut creating = self.creating.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map's reference and ours remain: nobody is waiting.
            if creating
                .get(room_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &creation_lock) && Arc::strong_count(entry) == 2)
            {
                creating.remove(room_id);
            }
        }
        result
    }

    async fn create_room(&self, room_id: &str, deadline: Instant) -> RoomResult<Arc<Room>> {
        info!("Creating new room: {}", room_id);
        let session = match tokio::time::timeout_at(deadline, self.engine.create_session(room_id)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!("Media session for room {} could not be created: {}", room_id, e);
                return Err(RoomError::Unavailable(e.to_string()));
            }
            Err(_) => {
                warn!(
                    "Media session for room {} timed out after {:?}",
                    room_id, self.settings.creation_timeout
                );
                return Err(RoomError::CreationTimedOut);
            }
        };

        let room = Arc::new(Room::new(
            room_id.to_string(),
            session,
            self.settings.chat_history_limit,
            self.settings.max_consumers_per_peer,
        ));
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room_id.to_string(), Arc::clone(&room));
        self.metrics.inc(Counter::RoomsCreated);
        Ok(room)
    }

    /// Resolves the room and registers the peer in it, returning the room and
    /// the other members at admission time.
    pub async fn admit(
        &self,
        room_id: &str,
        peer_id: &str,
        user: UserProfile,
        sender: EventSender,
    ) -> RoomResult<(Arc<Room>, Vec<ParticipantInfo>)> {
        for _ in 0..ADMIT_ATTEMPTS {
            let room = self.resolve_or_create(room_id).await?;
            match room.admit(peer_id, user.clone(), sender.clone()).await {
                Ok(others) => {
                    self.metrics.inc(Counter::Joins);
                    return Ok((room, others));
                }
                Err(RoomError::RoomClosed) => {
                    debug!("Room {} closed during admission of {}, retrying", room_id, peer_id);
                    self.evict(&room);
                }
                Err(e) => return Err(e),
            }
        }
        Err(RoomError::RoomClosed)
    }

    /// Runs cleanup for a departing peer and evicts the room if it emptied.
    /// Returns `None` when the peer had already been cleaned up.
    pub async fn depart(&self, room: &Arc<Room>, peer_id: &str) -> Option<CleanupOutcome> {
        let outcome = room.cleanup(peer_id).await?;
        self.metrics.inc(Counter::Leaves);
        if outcome.room_emptied {
            self.evict(room);
        }
        Some(outcome)
    }

    /// Closes and evicts the room if nobody is in it.
    pub async fn evict_if_empty(&self, room_id: &str) -> bool {
        let room = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            match rooms.get(room_id) {
                Some(room) => Arc::clone(room),
                None => return false,
            }
        };
        if room.close_if_empty().await {
            self.evict(&room);
            true
        } else {
            false
        }
    }

    /// Removes this exact room instance from the map; a newer room under the same id is left alone.
    fn evict(&self, room: &Arc<Room>) {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            match rooms.get(&room.id) {
                Some(current) if Arc::ptr_eq(current, room) => rooms.remove(&room.id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.meetings.remove(&room.id);
            self.metrics.inc(Counter::RoomsEvicted);
            info!("Room {} evicted", room.id);
        }
    }

    /// Creates meeting metadata and provisions its room eagerly. The room is
    /// evicted after the grace window if nobody has joined by then.
    pub async fn provision(self: &Arc<Self>, host_id: &str, topic: Option<&str>) -> RoomResult<MeetingMeta> {
        let meta = self.meetings.create(host_id, topic);
        if let Err(e) = self.resolve_or_create(&meta.room_id).await {
            self.meetings.remove(&meta.room_id);
            return Err(e);
        }
        self.schedule_idle_eviction(meta.room_id.clone());
        info!("Provisioned room {} for host {}", meta.room_id, host_id);
        Ok(meta)
    }

    fn schedule_idle_eviction(self: &Arc<Self>, room_id: String) {
        let registry = Arc::downgrade(self);
        let grace = self.settings.empty_room_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                if registry.evict_if_empty(&room_id).await {
                    debug!("Room {} was never joined; released after grace period", room_id);
                }
            }
        });
    }

    /// Closes every room and the media engine.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().map(|(_, room)| room).collect()
        };
        info!("Closing {} rooms", rooms.len());
        for room in rooms {
            room.close().await;
        }
        self.engine.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::FakeEngine;
    use crate::room::tests::user;
    use crate::signaling::protocol::ErrorCode;
    use tokio::sync::mpsc;

    fn settings() -> RegistrySettings {
        RegistrySettings {
            creation_timeout: Duration::from_secs(5),
            empty_room_grace: Duration::from_secs(60),
            chat_history_limit: 50,
            max_consumers_per_peer: 16,
        }
    }

    fn registry_with(engine: &Arc<FakeEngine>) -> Arc<RoomRegistry> {
        let engine: Arc<dyn MediaEngine> = engine.clone();
        Arc::new(RoomRegistry::new(engine, ServerMetrics::new(), settings()))
    }

    #[tokio::test]
    async fn test_concurrent_resolve_creates_one_room() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.resolve_or_create("R1").await.unwrap() })
            })
            .collect();
        let mut rooms = Vec::new();
        for task in tasks {
            rooms.push(task.await.unwrap());
        }

        assert_eq!(engine.sessions().len(), 1);
        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
        assert_eq!(registry.room_count(), 1);
        assert!(registry.creating.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_creation_registers_nothing() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        engine.fail_sessions(true);

        let err = registry.resolve_or_create("R1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomUnavailable);
        assert!(registry.lookup("R1").is_none());
        assert_eq!(registry.room_count(), 0);

        engine.fail_sessions(false);
        assert!(registry.resolve_or_create("R1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_creation_times_out() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        engine.stall_sessions(true);

        let err = registry.resolve_or_create("R1").await.unwrap_err();
        assert!(matches!(err, RoomError::CreationTimedOut));
        assert_eq!(err.code(), ErrorCode::RoomUnavailable);
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_share_one_creation_deadline() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        engine.stall_sessions(true);

        let start = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let (tx, _rx) = mpsc::channel(16);
                    let peer = format!("P{}", i);
                    let result = registry.admit("R1", &peer, user(&peer), tx).await;
                    (result.map(|_| ()), start.elapsed())
                })
            })
            .collect();

        for task in tasks {
            let (result, elapsed) = task.await.unwrap();
            let err = result.unwrap_err();
            assert!(matches!(err, RoomError::CreationTimedOut));
            assert_eq!(err.code(), ErrorCode::RoomUnavailable);
            assert!(elapsed <= settings().creation_timeout + Duration::from_millis(10), "{:?}", elapsed);
        }
        assert_eq!(engine.sessions().len(), 0);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.creating.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_room_lifecycle_follows_membership() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        let (tx, _rx) = mpsc::channel(16);

        let (room, others) = registry.admit("R1", "A", user("A"), tx.clone()).await.unwrap();
        assert!(others.is_empty());
        let (_, others) = registry.admit("R1", "B", user("B"), tx).await.unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(registry.total_participant_count(), 2);

        assert!(registry.depart(&room, "A").await.is_some());
        assert!(registry.depart(&room, "A").await.is_none());
        assert!(registry.lookup("R1").is_some());

        let outcome = registry.depart(&room, "B").await.unwrap();
        assert!(outcome.room_emptied);
        assert!(registry.lookup("R1").is_none());
        assert_eq!(registry.room_count(), 0);
        assert!(engine.sessions()[0].is_closed());
    }

    #[tokio::test]
    async fn test_admit_replaces_closed_room() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);

        let stale = registry.resolve_or_create("R1").await.unwrap();
        assert!(stale.close_if_empty().await);

        let (tx, _rx) = mpsc::channel(16);
        let (room, _) = registry.admit("R1", "A", user("A"), tx).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &stale));
        assert_eq!(engine.sessions().len(), 2);
        assert!(Arc::ptr_eq(&registry.lookup("R1").unwrap(), &room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioned_room_released_after_grace() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);

        let meta = registry.provision("host-1", Some("Design review")).await.unwrap();
        assert_eq!(meta.topic, "Design review");
        assert!(registry.lookup(&meta.room_id).is_some());
        assert!(registry.meetings().get(&meta.room_id).is_some());

        tokio::time::sleep(settings().empty_room_grace + Duration::from_secs(1)).await;
        assert!(registry.lookup(&meta.room_id).is_none());
        assert!(registry.meetings().get(&meta.room_id).is_none());
        assert!(engine.sessions()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_provisioned_room_survives_grace() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        let meta = registry.provision("host-1", None).await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        registry.admit(&meta.room_id, "A", user("A"), tx).await.unwrap();

        tokio::time::sleep(settings().empty_room_grace + Duration::from_secs(1)).await;
        assert!(registry.lookup(&meta.room_id).is_some());
        assert!(registry.meetings().get(&meta.room_id).is_some());
    }

    #[tokio::test]
    async fn test_failed_provision_drops_metadata() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        engine.fail_sessions(true);

        assert!(registry.provision("host-1", None).await.is_err());
        assert!(registry.meetings().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let engine = FakeEngine::new();
        let registry = registry_with(&engine);
        let (tx, _rx) = mpsc::channel(16);
        let (room, _) = registry.admit("R1", "A", user("A"), tx).await.unwrap();
        room.create_transport("A", crate::media::Direction::Send).await.unwrap();

        registry.shutdown().await;
        assert_eq!(registry.room_count(), 0);
        assert!(room.is_closed());
        assert_eq!(engine.open_handles(), 0);
    }
}
