//! Closed error taxonomy (spec §7) with a matching `IntoResponse` impl.
//!
//! The REST surface never leaks an internal `anyhow`/`io` error message
//! directly; everything that reaches a client goes through this type so the
//! `{error:{code,message,details?}}` envelope and status mapping stay in one
//! place instead of scattered per-handler tuples.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("flow not found: {0}")]
    FlowNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("request not found: {0}")]
    RequestNotFound(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("websocket session not found: {0}")]
    WsSessionNotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("content or path is required")]
    ContentOrPathRequired,
    #[error("request index {index} out of range (have {len})")]
    RequestIndexOutOfRange { index: usize, len: usize },
    #[error("path escapes workspace: {0}")]
    PathOutsideWorkspace(String),
    #[error("binary websocket frames are not supported in this protocol version")]
    WsBinaryUnsupported,
    #[error("frame of {size} bytes exceeds max_frame_bytes ({max})")]
    WsFrameTooLarge { size: usize, max: usize },
    #[error("replay gap: requested after {after_seq}, oldest available is {oldest}")]
    WsReplayGap { after_seq: u64, oldest: u64 },

    #[error("parse error: {0}")]
    Parse(String),
    #[error("document contains no requests")]
    NoRequestsFound,

    #[error("execution failed: {0}")]
    Execute(String),

    #[error("session limit reached")]
    SessionLimitReached,
    #[error("flow limit reached")]
    FlowLimitReached,
    #[error("websocket session limit reached")]
    WsSessionLimitReached,

    #[error("execution timed out")]
    Timeout,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "SessionNotFound",
            ApiError::FlowNotFound(_) => "FlowNotFound",
            ApiError::ExecutionNotFound(_) => "ExecutionNotFound",
            ApiError::RequestNotFound(_) => "RequestNotFound",
            ApiError::FileNotFound(_) => "FileNotFound",
            ApiError::WsSessionNotFound(_) => "WsSessionNotFound",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::ContentOrPathRequired => "ContentOrPathRequired",
            ApiError::RequestIndexOutOfRange { .. } => "RequestIndexOutOfRange",
            ApiError::PathOutsideWorkspace(_) => "PathOutsideWorkspace",
            ApiError::WsBinaryUnsupported => "WsBinaryUnsupported",
            ApiError::WsFrameTooLarge { .. } => "WsFrameTooLarge",
            ApiError::WsReplayGap { .. } => "WsReplayGap",
            ApiError::Parse(_) => "Parse",
            ApiError::NoRequestsFound => "NoRequestsFound",
            ApiError::Execute(_) => "Execute",
            ApiError::SessionLimitReached => "SessionLimitReached",
            ApiError::FlowLimitReached => "FlowLimitReached",
            ApiError::WsSessionLimitReached => "WsSessionLimitReached",
            ApiError::Timeout => "Timeout",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_)
            | ApiError::FlowNotFound(_)
            | ApiError::ExecutionNotFound(_)
            | ApiError::RequestNotFound(_)
            | ApiError::FileNotFound(_)
            | ApiError::WsSessionNotFound(_) => StatusCode::NOT_FOUND,

            ApiError::ValidationError(_)
            | ApiError::ContentOrPathRequired
            | ApiError::RequestIndexOutOfRange { .. }
            | ApiError::Parse(_)
            | ApiError::NoRequestsFound => StatusCode::BAD_REQUEST,

            ApiError::PathOutsideWorkspace(_)
            | ApiError::WsBinaryUnsupported
            | ApiError::WsFrameTooLarge { .. }
            | ApiError::WsReplayGap { .. } => StatusCode::FORBIDDEN,

            ApiError::Execute(_) => StatusCode::INTERNAL_SERVER_ERROR,

            ApiError::SessionLimitReached
            | ApiError::FlowLimitReached
            | ApiError::WsSessionLimitReached => StatusCode::SERVICE_UNAVAILABLE,

            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            ApiError::RequestIndexOutOfRange { index, len } => {
                Some(serde_json::json!({ "index": index, "len": len }))
            }
            ApiError::WsFrameTooLarge { size, max } => {
                Some(serde_json::json!({ "size": size, "max": max }))
            }
            ApiError::WsReplayGap { after_seq, oldest } => {
                Some(serde_json::json!({ "afterSeq": after_seq, "oldestAvailableSeq": oldest }))
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let details = self.details();
        tracing::warn!(code, %status, "request failed: {self}");
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
