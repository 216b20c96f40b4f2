#![forbid(unsafe_code)]

use crate::auth::{self, types::AuthError};
use crate::room::meetings::MeetingMeta;
use crate::room::RoomError;
use crate::signaling::SignalingServer;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub room: MeetingMeta,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    pub room: MeetingMeta,
    pub participant_count: usize,
}

#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    NotFound,
    Unavailable(RoomError),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(e) => e.into_response(),
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not-found" }))).into_response()
            }
            ApiError::Unavailable(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.code() })),
            )
                .into_response(),
        }
    }
}

/// POST /api/rooms
pub async fn create_room(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    payload: Option<Json<CreateRoomRequest>>,
) -> Result<Json<CreateRoomResponse>, ApiError> {
    let claims = auth::authorize(&headers, server.jwt_secret())?;
    let req = payload.map(|Json(req)| req).unwrap_or_default();

    let room = server
        .registry()
        .provision(&claims.sub, req.topic.as_deref())
        .await
        .map_err(|e| {
            warn!("Room provisioning for {} failed: {}", claims.email, e);
            ApiError::Unavailable(e)
        })?;

    Ok(Json(CreateRoomResponse {
        room_id: room.room_id.clone(),
        room,
    }))
}

/// GET /api/rooms/:room_id
pub async fn get_room(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomDetails>, ApiError> {
    auth::authorize(&headers, server.jwt_secret())?;

    let registry = server.registry();
    let room = registry.meetings().get(&room_id).ok_or(ApiError::NotFound)?;
    let participant_count = registry
        .lookup(&room_id)
        .map(|r| r.participant_count())
        .unwrap_or(0);

    Ok(Json(RoomDetails {
        room,
        participant_count,
    }))
}
