//! `GET /plugins` (spec §6): loaded plugin introspection.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub hooks: Vec<&'static str>,
    pub resolvers: Vec<String>,
}

pub async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginInfo>> {
    let plugins = state
        .plugins
        .plugins()
        .iter()
        .map(|p| {
            let caps = p.capabilities();
            PluginInfo {
                name: p.name().to_string(),
                hooks: caps.hooks.iter().map(|h| h.as_str()).collect(),
                resolvers: caps.resolvers.iter().cloned().collect(),
            }
        })
        .collect();
    Json(plugins)
}
