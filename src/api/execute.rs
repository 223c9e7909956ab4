//! `POST /execute` and `POST /execute/sse` (spec §6, §4.3, §4.4).

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;

use super::AppState;
use crate::engine::ExecuteInput;
use crate::error::ApiResult;
use crate::sse_exec;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequestBody {
    #[serde(rename = "flowId")]
    pub flow_id: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub content: Option<String>,
    pub path: Option<String>,
    #[serde(rename = "basePath")]
    pub base_path: Option<String>,
    pub name: Option<String>,
    pub index: Option<usize>,
    pub variables: Option<BTreeMap<String, String>>,
    pub profile: Option<String>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(rename = "lastEventId", default)]
    pub last_event_id: Option<String>,
}

impl From<ExecuteRequestBody> for ExecuteInput {
    fn from(body: ExecuteRequestBody) -> Self {
        ExecuteInput {
            flow_id: body.flow_id,
            session_id: body.session_id,
            content: body.content,
            path: body.path,
            base_path: body.base_path,
            name: body.name,
            index: body.index,
            variables: body.variables,
            profile: body.profile,
            timeout_ms: body.timeout_ms,
            max_retries: body.max_retries,
        }
    }
}

pub async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteRequestBody>) -> ApiResult<Json<serde_json::Value>> {
    let input: ExecuteInput = body.into();
    let response = state.engine.execute(input).await?;
    Ok(Json(serde_json::to_value(response).unwrap()))
}

pub async fn execute_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequestBody>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let accept_header = headers.get(axum::http::header::ACCEPT).and_then(|h| h.to_str().ok()).map(str::to_string);
    let last_event_id = body.last_event_id.clone();
    let input: ExecuteInput = body.into();

    let prepared = state.engine.prepare_sse_request(&input).await?;
    sse_exec::validate_sse_eligible(&prepared.protocol, accept_header.as_deref())?;

    sse_exec::execute_sse(
        state.engine.http_client(),
        &prepared.url,
        &prepared.headers,
        last_event_id.as_deref(),
        prepared.run_id,
    )
    .await
}
