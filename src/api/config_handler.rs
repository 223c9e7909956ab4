//! `GET /config?profile&path` (spec §6): resolved configuration summary,
//! sensitive variables already redacted by `ResolvedConfig`'s own
//! `ConfigResolver` (read-time redaction happens below, mirroring
//! `SessionManager::get`).

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::AppState;
use crate::error::ApiResult;
use crate::redact::redact_variables;

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    pub profile: Option<String>,
    #[allow(dead_code)]
    pub path: Option<String>,
}

pub async fn get_config(State(state): State<AppState>, Query(query): Query<ConfigQuery>) -> ApiResult<Json<serde_json::Value>> {
    let mut resolved = state
        .config_resolver
        .resolve(query.profile.as_deref(), None, None)
        .await
        .map_err(|e| crate::error::ApiError::ValidationError(e.to_string()))?;
    resolved.variables = redact_variables(&resolved.variables);
    Ok(Json(serde_json::to_value(resolved).unwrap()))
}
