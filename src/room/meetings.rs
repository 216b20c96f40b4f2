#![forbid(unsafe_code)]

// Meeting metadata (topic, host, creation time), kept in memory for the
// lifetime of the room.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const DEFAULT_TOPIC: &str = "Quick sync";
const MAX_TOPIC_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingMeta {
    pub room_id: String,
    pub host_id: String,
    pub topic: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// Generates an unpredictable 10-character join code.
pub fn generate_room_id() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    hex::encode(digest)[..10].to_uppercase()
}

#[derive(Default)]
pub struct MeetingStore {
    meetings: StdRwLock<HashMap<String, MeetingMeta>>,
}

impl MeetingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new meeting under a fresh id.
    pub fn create(&self, host_id: &str, topic: Option<&str>) -> MeetingMeta {
        let topic = topic
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.chars().take(MAX_TOPIC_CHARS).collect())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut meetings = self.meetings.write().unwrap_or_else(|e| e.into_inner());
        let mut room_id = generate_room_id();
        while meetings.contains_key(&room_id) {
            room_id = generate_room_id();
        }
        let meta = MeetingMeta {
            room_id: room_id.clone(),
            host_id: host_id.to_string(),
            topic,
            created_at,
        };
        meetings.insert(room_id, meta.clone());
        meta
    }

    pub fn get(&self, room_id: &str) -> Option<MeetingMeta> {
        self.meetings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    pub fn remove(&self, room_id: &str) -> Option<MeetingMeta> {
        self.meetings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(room_id)
    }

    pub fn len(&self) -> usize {
        self.meetings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
