//! `POST /parse` (spec §6, §4.3 steps 1-2): load content, hand it to the
//! external parser, resolve configuration alongside it so a caller can
//! preview what `/execute` would see without dispatching anything.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::ids::new_id;
use crate::model::{Diagnostics, ParsedRequest};
use crate::plugin::HookStage;

#[derive(Debug, Deserialize)]
pub struct ParseRequestBody {
    pub content: Option<String>,
    pub path: Option<String>,
    #[serde(default, rename = "basePath")]
    pub base_path: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ParsedRequestEntry {
    pub request: ParsedRequest,
    pub diagnostics: Vec<Diagnostics>,
}

#[derive(Debug, Serialize)]
pub struct ParseResponse {
    pub requests: Vec<ParsedRequestEntry>,
    pub diagnostics: Vec<Diagnostics>,
    pub resolved: crate::model::ResolvedConfig,
}

pub async fn parse(State(state): State<AppState>, Json(body): Json<ParseRequestBody>) -> ApiResult<Json<ParseResponse>> {
    let loaded = state.content_loader.load(body.content.as_deref(), body.path.as_deref(), body.base_path.as_deref()).await?;

    let parsed = state
        .parser
        .parse(&loaded.text)
        .await
        .map_err(|e| ApiError::Parse(e.to_string()))?;

    if parsed.is_empty() {
        return Err(ApiError::NoRequestsFound);
    }

    let parse_after_input = serde_json::json!({ "requestCount": parsed.len() });
    let mut report_seq = 0u64;
    state
        .plugins
        .dispatch(HookStage::ParseAfter, &parse_after_input, None, &new_id(), None, None, None, &mut report_seq)
        .await;

    let resolved = state
        .config_resolver
        .resolve(body.profile.as_deref(), None, None)
        .await
        .map_err(|e| ApiError::ValidationError(e.to_string()))?;

    let requests = parsed
        .into_iter()
        .map(|request| ParsedRequestEntry {
            request,
            diagnostics: Vec::new(),
        })
        .collect();

    Ok(Json(ParseResponse {
        requests,
        diagnostics: Vec::new(),
        resolved,
    }))
}
