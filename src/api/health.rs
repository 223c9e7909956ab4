use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

pub const PROTOCOL_VERSION: &str = "1.0";

pub async fn health() -> Json<Value> {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn capabilities(State(_state): State<AppState>) -> Json<Value> {
    Json(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "version": env!("CARGO_PKG_VERSION"),
        "features": {
            "sessions": true,
            "diagnostics": true,
            "streamingBodies": true,
        },
    }))
}
