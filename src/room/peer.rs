#![forbid(unsafe_code)]

// Per-connection participant state

use crate::auth::types::UserProfile;
use crate::media::Direction;
use crate::signaling::protocol::{EventSender, ParticipantInfo};
use std::collections::HashSet;

/// A participant's live connection within a room. Owns the ids of every
/// transport, producer and consumer created on its behalf; cleanup walks these sets.
pub struct Peer {
    pub id: String,
    pub user: UserProfile,
    pub sender: EventSender,
    pub send_transport: Option<String>,
    pub recv_transport: Option<String>,
    pub producers: HashSet<String>,
    pub consumers: HashSet<String>,
}

impl Peer {
    pub fn new(id: String, user: UserProfile, sender: EventSender) -> Self {
        Self {
            id,
            user,
            sender,
            send_transport: None,
            recv_transport: None,
            producers: HashSet::new(),
            consumers: HashSet::new(),
        }
    }

    pub fn transport(&self, direction: Direction) -> Option<&String> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Recv => self.recv_transport.as_ref(),
        }
    }

    /// Records `transport_id` for `direction`, returning the id it replaces.
    pub fn set_transport(&mut self, direction: Direction, transport_id: String) -> Option<String> {
        let slot = match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Recv => &mut self.recv_transport,
        };
        slot.replace(transport_id)
    }

    pub fn clear_transport(&mut self, transport_id: &str) {
        if self.send_transport.as_deref() == Some(transport_id) {
            self.send_transport = None;
        }
        if self.recv_transport.as_deref() == Some(transport_id) {
            self.recv_transport = None;
        }
    }

    pub fn transports(&self) -> Vec<String> {
        self.send_transport
            .iter()
            .chain(self.recv_transport.iter())
            .cloned()
            .collect()
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            user: self.user.clone(),
        }
    }
}
