//! Flow CRUD + drill-down (spec §6, §4.2).

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize, Default)]
pub struct CreateFlowBody {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct CreateFlowResponse {
    #[serde(rename = "flowId")]
    pub flow_id: String,
}

pub async fn create_flow(
    State(state): State<AppState>,
    Json(body): Json<CreateFlowBody>,
) -> ApiResult<Json<CreateFlowResponse>> {
    let flow_id = state.flows.create(body.session_id, body.label, body.meta).await?;
    Ok(Json(CreateFlowResponse { flow_id }))
}

pub async fn finish_flow(State(state): State<AppState>, Path(flow_id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let result = state.flows.finish(&flow_id).await?;
    Ok(Json(serde_json::json!({
        "flowId": result.flow_id,
        "summary": result.summary,
    })))
}

pub async fn get_flow_execution(
    State(state): State<AppState>,
    Path((flow_id, req_exec_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let exec = state.flows.get_execution(&flow_id, &req_exec_id).await?;
    Ok(Json(serde_json::to_value(exec).unwrap()))
}

pub async fn get_flow(State(state): State<AppState>, Path(flow_id): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let flow = state.flows.get(&flow_id).await?;
    Ok(Json(serde_json::to_value(flow).unwrap()))
}
