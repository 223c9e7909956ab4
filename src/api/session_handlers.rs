//! Session CRUD (spec §6, §4.1).

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiResult;
use crate::session::UpdateMode;

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub variables: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Json<CreateSessionResponse> {
    let session_id = state.sessions.create(body.variables).await;
    Json(CreateSessionResponse { session_id })
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state.sessions.get(&id).await?;
    Ok(Json(serde_json::to_value(snapshot).unwrap()))
}

#[derive(Debug, Deserialize)]
pub struct UpdateVariablesBody {
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpdateVariablesResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "snapshotVersion")]
    pub snapshot_version: u64,
}

pub async fn update_session_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateVariablesBody>,
) -> ApiResult<Json<UpdateVariablesResponse>> {
    let mode = match body.mode.as_deref() {
        Some("replace") => UpdateMode::Replace,
        _ => UpdateMode::Merge,
    };
    let (session_id, snapshot_version) = state.sessions.update(&id, body.variables, mode).await?;
    Ok(Json(UpdateVariablesResponse {
        session_id,
        snapshot_version,
    }))
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<axum::http::StatusCode> {
    state.sessions.delete(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
