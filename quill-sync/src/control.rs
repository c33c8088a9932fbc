//! HTTP control endpoint.
//!
//! - `GET /` liveness text
//! - `POST /rooms` create a room, optional body `{ "ownerId": "..." }`
//! - `GET /rooms/{room_id}` fetch a room record

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::storage::{RoomDirectory, RoomRecord, StoreError};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub owner_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Control endpoint failure, rendered as a JSON error body.
#[derive(Debug)]
pub enum ControlError {
    NotFound(String),
    Store(StoreError),
    Internal(String),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ControlError::NotFound(room_id) => {
                (StatusCode::NOT_FOUND, format!("room '{room_id}' not found"))
            }
            ControlError::Store(e) => {
                log::error!("Control endpoint store failure: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ControlError::Internal(reason) => {
                log::error!("Control endpoint failure: {reason}");
                (StatusCode::INTERNAL_SERVER_ERROR, reason)
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        ControlError::Store(e)
    }
}

type Directory = Arc<dyn RoomDirectory>;

/// Build the control router over a room directory.
pub fn router(directory: Directory) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/rooms", post(create_room))
        .route("/rooms/{room_id}", get(get_room))
        .with_state(directory)
}

async fn health() -> &'static str {
    "quill-sync is running"
}

async fn create_room(
    State(directory): State<Directory>,
    body: Option<Json<CreateRoomRequest>>,
) -> Result<(StatusCode, Json<RoomRecord>), ControlError> {
    let owner_id = body.and_then(|Json(req)| req.owner_id);
    let record = tokio::task::spawn_blocking(move || directory.create_room(owner_id))
        .await
        .map_err(|e| ControlError::Internal(e.to_string()))??;

    log::info!(
        "Created room {} (owner {})",
        record.room_id,
        record.owner_id.as_deref().unwrap_or("none")
    );
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_room(
    State(directory): State<Directory>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomRecord>, ControlError> {
    let lookup = room_id.clone();
    let record = tokio::task::spawn_blocking(move || directory.get_room(&lookup))
        .await
        .map_err(|e| ControlError::Internal(e.to_string()))??;

    record.map(Json).ok_or(ControlError::NotFound(room_id))
}
