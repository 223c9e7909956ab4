//! Script & test child-process runner routes (spec §6).

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiResult;
use crate::scripts::{RunKind, RunRequest};

#[derive(Debug, Deserialize)]
pub struct RunBody {
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "flowId", default)]
    pub flow_id: Option<String>,
    #[serde(rename = "timeoutMs", default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    #[serde(rename = "runId")]
    pub run_id: String,
}

async fn spawn_run(state: &AppState, kind: RunKind, body: RunBody) -> ApiResult<Json<RunResponse>> {
    let run_id = state
        .scripts
        .spawn(RunRequest {
            kind,
            command: body.command,
            cwd: body.cwd,
            env: body.env,
            flow_id: body.flow_id,
            timeout_ms: body.timeout_ms,
        })
        .await?;
    Ok(Json(RunResponse { run_id }))
}

pub async fn run_script(State(state): State<AppState>, Json(body): Json<RunBody>) -> ApiResult<Json<RunResponse>> {
    spawn_run(&state, RunKind::Script, body).await
}

pub async fn run_test(State(state): State<AppState>, Json(body): Json<RunBody>) -> ApiResult<Json<RunResponse>> {
    spawn_run(&state, RunKind::Test, body).await
}

pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<StatusCode> {
    state.scripts.cancel(&run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn script_runners(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    Json(state.scripts.script_runners())
}

pub async fn test_frameworks(State(state): State<AppState>) -> Json<Vec<&'static str>> {
    Json(state.scripts.test_frameworks())
}
