#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::auth::types::UserProfile;
use crate::media::{Direction, MediaKind};
use crate::room::chat::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Per-connection outbound queue of serialized frames.
pub type EventSender = mpsc::Sender<Arc<String>>;

/// Client-to-Server frame: a correlated request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Client-to-Server requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Fetch router capabilities, existing producers and chat history
    JoinRoom,
    CreateTransport {
        direction: Direction,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CloseTransport {
        transport_id: String,
    },
    SendMessage {
        text: String,
    },
    LeaveRoom,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::JoinRoom => "joinRoom",
            Request::CreateTransport { .. } => "createTransport",
            Request::ConnectTransport { .. } => "connectTransport",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
            Request::ResumeConsumer { .. } => "resumeConsumer",
            Request::CloseProducer { .. } => "closeProducer",
            Request::CloseTransport { .. } => "closeTransport",
            Request::SendMessage { .. } => "sendMessage",
            Request::LeaveRoom => "leaveRoom",
        }
    }
}

/// Reply payloads, one shape per request
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    #[serde(rename_all = "camelCase")]
    Joined {
        rtp_capabilities: Value,
        existing_producers: Vec<ProducerInfo>,
        chat_history: Vec<ChatMessage>,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        id: String,
        direction: Direction,
        ice_parameters: Value,
        ice_candidates: Value,
        dtls_parameters: Value,
    },
    Connected {
        connected: bool,
    },
    Produced {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    Consumed {
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    Resumed {
        resumed: bool,
    },
    Delivered {
        delivered: bool,
    },
    Closed {
        closed: bool,
    },
    Left {
        left: bool,
    },
}

/// Request-level failure reasons, sent only to the requesting connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    RecvTransportNotFound,
    CantConsume,
    PeerGone,
    RoomUnavailable,
    EngineError,
    ConsumerLimit,
    MessageTooLong,
    InvalidRequest,
    RateLimited,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransportNotFound => "transport-not-found",
            ErrorCode::ProducerNotFound => "producer-not-found",
            ErrorCode::ConsumerNotFound => "consumer-not-found",
            ErrorCode::RecvTransportNotFound => "recv-transport-not-found",
            ErrorCode::CantConsume => "cant-consume",
            ErrorCode::PeerGone => "peer-gone",
            ErrorCode::RoomUnavailable => "room-unavailable",
            ErrorCode::EngineError => "engine-error",
            ErrorCode::ConsumerLimit => "consumer-limit",
            ErrorCode::MessageTooLong => "message-too-long",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::RateLimited => "rate-limited",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Reply to a request
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        data: Response,
    },
    /// Request failed; `requestId` is absent when the frame could not be parsed
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        error: ErrorCode,
    },
    /// Admission succeeded
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        self_id: String,
        participants: Vec<ParticipantInfo>,
    },
    /// Admission failed; the connection closes after this
    RoomError {
        message: String,
    },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft {
        id: String,
    },
    NewProducer(ProducerInfo),
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        peer_id: String,
    },
    ChatNewMessage {
        message: ChatMessage,
    },
}

impl ServerMessage {
    pub fn response(request_id: u64, data: Response) -> Self {
        ServerMessage::Response { request_id, data }
    }

    pub fn error(request_id: Option<u64>, error: ErrorCode) -> Self {
        ServerMessage::Error { request_id, error }
    }

    /// Serializes once so a broadcast shares one buffer across peers.
    pub fn to_frame(&self) -> Option<Arc<String>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize server message: {}", e);
                None
            }
        }
    }
}

/// A room member as seen by other members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub user: UserProfile,
}

/// A live producer as announced to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub user: UserProfile,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> UserProfile {
        UserProfile {
            id: "u-1".to_string(),
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            avatar: None,
        }
    }

    #[test]
    fn test_parse_request_envelope() {
        let frame = r#"{"requestId":7,"type":"produce","transportId":"t1","kind":"video","rtpParameters":{"codecs":[]}}"#;
        let envelope: ClientEnvelope = serde_json::from_str(frame).unwrap();
        assert_eq!(envelope.request_id, 7);
        match envelope.request {
            Request::Produce { transport_id, kind, rtp_parameters } => {
                assert_eq!(transport_id, "t1");
                assert_eq!(kind, MediaKind::Video);
                assert_eq!(rtp_parameters, json!({ "codecs": [] }));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_parse_unit_and_direction_requests() {
        let join: ClientEnvelope = serde_json::from_str(r#"{"requestId":1,"type":"joinRoom"}"#).unwrap();
        assert!(matches!(join.request, Request::JoinRoom));

        let create: ClientEnvelope =
            serde_json::from_str(r#"{"requestId":2,"type":"createTransport","direction":"recv"}"#).unwrap();
        assert!(matches!(create.request, Request::CreateTransport { direction: Direction::Recv }));
    }

    #[test]
    fn test_unknown_request_rejected() {
        let result = serde_json::from_str::<ClientEnvelope>(r#"{"requestId":3,"type":"explode"}"#);
        assert!(result.is_err());
        let result = serde_json::from_str::<ClientEnvelope>(r#"{"type":"joinRoom"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_wire_shape() {
        let msg = ServerMessage::response(4, Response::Resumed { resumed: true });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "response", "requestId": 4, "data": { "resumed": true } })
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let msg = ServerMessage::error(Some(9), ErrorCode::RecvTransportNotFound);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "error", "requestId": 9, "error": "recv-transport-not-found" })
        );
        let msg = ServerMessage::error(None, ErrorCode::InvalidRequest);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "error", "error": "invalid-request" })
        );
    }

    #[test]
    fn test_push_event_shapes() {
        let msg = ServerMessage::NewProducer(ProducerInfo {
            producer_id: "p1".to_string(),
            peer_id: "peer-a".to_string(),
            kind: MediaKind::Audio,
            user: alice(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["producerId"], "p1");
        assert_eq!(value["peerId"], "peer-a");
        assert_eq!(value["kind"], "audio");
        assert_eq!(value["user"]["name"], "Alice");

        let msg = ServerMessage::ParticipantJoined(ParticipantInfo { id: "peer-b".to_string(), user: alice() });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "participantJoined");
        assert_eq!(value["id"], "peer-b");
    }

    #[test]
    fn test_error_code_display_matches_wire() {
        for code in [ErrorCode::CantConsume, ErrorCode::PeerGone, ErrorCode::MessageTooLong] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.to_string()));
        }
    }
}
