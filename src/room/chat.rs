#![forbid(unsafe_code)]

// Room chat transcript

use crate::auth::types::UserProfile;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Longest accepted message body, in bytes after trimming.
pub const MAX_MESSAGE_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: UserProfile,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(text: String, sender: UserProfile) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4().to_string(),
            text,
            sender,
            timestamp,
        }
    }
}

/// Append-only message log holding at most `limit` messages; the oldest go first.
#[derive(Debug)]
pub struct Transcript {
    messages: VecDeque<ChatMessage>,
    limit: usize,
}

impl Transcript {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit,
        }
    }

    pub fn append(&mut self, message: ChatMessage) {
        if self.limit == 0 {
            return;
        }
        while self.messages.len() >= self.limit {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Retained messages in append order.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }
}
