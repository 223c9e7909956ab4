//! `GET /ws/session/{id}` (spec §6, §4.5): the WebSocket control channel.
//! The client-facing socket speaks the closed control protocol
//! (`send`/`close`/`replay` ops in, `session.*` envelopes out); the actual
//! upstream connection is owned entirely by `WsSessionManager::run_upstream`.

use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::error::ApiResult;
use crate::ws::OpenRequest;

#[derive(Debug, Deserialize)]
pub struct WsOpenQuery {
    #[serde(rename = "upstreamUrl")]
    pub upstream_url: String,
    #[serde(rename = "flowId", default)]
    pub flow_id: Option<String>,
    #[serde(rename = "reqExecId", default)]
    pub req_exec_id: Option<String>,
    #[serde(default)]
    pub subprotocol: Option<String>,
    #[serde(rename = "idleTimeoutMs", default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(rename = "maxFrameBytes", default)]
    pub max_frame_bytes: Option<usize>,
    #[serde(rename = "replayBufferSize", default)]
    pub replay_buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ClientOp {
    Send {
        #[serde(rename = "payloadType")]
        payload_type: String,
        payload: Value,
    },
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
    Replay {
        #[serde(rename = "afterSeq")]
        after_seq: Option<u64>,
    },
}

pub async fn open_ws_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsOpenQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<impl IntoResponse> {
    let req = OpenRequest {
        upstream_url: query.upstream_url,
        flow_id: query.flow_id,
        req_exec_id: query.req_exec_id,
        subprotocol: query.subprotocol,
        idle_timeout_ms: query.idle_timeout_ms.unwrap_or(state.config.ws_idle_timeout_ms),
        max_frame_bytes: query.max_frame_bytes.unwrap_or(state.config.max_frame_bytes),
        replay_buffer_size: query.replay_buffer_size.unwrap_or(64),
    };

    let (session_id, control_rx) = state.ws_sessions.open(id, req).await?;

    Ok(ws.on_upgrade(move |socket| bridge(socket, state.clone(), session_id, control_rx)))
}

async fn bridge(
    mut socket: WebSocket,
    state: AppState,
    session_id: String,
    mut control_rx: tokio::sync::broadcast::Receiver<crate::model::WsEnvelope>,
) {
    loop {
        tokio::select! {
            envelope = control_rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        let Ok(text) = serde_json::to_string(&envelope) else { continue };
                        if socket.send(ClientMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(ClientMessage::Text(text))) => {
                        if handle_client_op(&mut socket, &state, &session_id, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Returns `Err` only when the client socket itself is gone (replay
/// frames failed to send); `send`/`close` errors surface to the client as
/// `session.error` envelopes via the broadcast channel, not here.
async fn handle_client_op(socket: &mut WebSocket, state: &AppState, session_id: &str, text: &str) -> Result<(), ()> {
    let op: ClientOp = match serde_json::from_str(text) {
        Ok(op) => op,
        Err(e) => {
            tracing::debug!(error = %e, "unrecognized websocket control op");
            return Ok(());
        }
    };

    match op {
        ClientOp::Send { payload_type, payload } => {
            let _ = state.ws_sessions.send(session_id, &payload_type, &payload).await;
        }
        ClientOp::Close { code, reason } => {
            let _ = state.ws_sessions.close(session_id, code, reason).await;
        }
        ClientOp::Replay { after_seq } => {
            if let Ok(envelopes) = state.ws_sessions.replay(session_id, after_seq).await {
                for envelope in envelopes {
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if socket.send(ClientMessage::Text(text.into())).await.is_err() {
                        return Err(());
                    }
                }
            }
        }
    }
    Ok(())
}
