//! Shared data types (spec §3): the wire/record shapes that flow between the
//! parser, sessions, flows, the execution engine, and the event bus.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Sse,
    Ws,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub value: String,
    #[serde(rename = "isFile", default)]
    pub is_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Output of the external `.http` parser. Consumed, not produced, by this
/// crate's own parsing step — the concrete `HttpSyntaxParser` only exists to
/// exercise the pipeline end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "bodyFile")]
    pub body_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "formData")]
    pub form_data: Option<Vec<FormField>>,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "protocolOptions")]
    pub protocol_options: Option<Value>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CookieMode {
    Disabled,
    Memory,
    Persistent,
}

/// Resolved configuration for one execution, layered project defaults →
/// session variables → per-request variables (spec §4.3 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub profile: String,
    pub variables: BTreeMap<String, String>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "maxBodyBytes")]
    pub max_body_bytes: usize,
    pub cookies: CookieMode,
    #[serde(skip_serializing_if = "Option::is_none", rename = "cookieJarPath")]
    pub cookie_jar_path: Option<PathBuf>,
    #[serde(rename = "workspaceRoot")]
    pub workspace_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub level: DiagLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "endTime")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "durationMs")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb: Option<i64>,
}

impl Timing {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start_time: start,
            end_time: None,
            duration_ms: None,
            ttfb: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodyEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub encoding: BodyEncoding,
    pub truncated: bool,
    #[serde(rename = "bodyBytes")]
    pub body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHookRecord {
    pub stage: String,
    #[serde(rename = "pluginName")]
    pub plugin_name: String,
    pub modified: bool,
    pub failed: bool,
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginReport {
    #[serde(rename = "pluginName")]
    pub plugin_name: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "flowId")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "reqExecId")]
    pub req_exec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "requestName")]
    pub request_name: Option<String>,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub data: Value,
}

/// One executed request inside a flow (spec §3). Never mutated once
/// `status` reaches `success`/`failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredExecution {
    #[serde(rename = "reqExecId")]
    pub req_exec_id: String,
    #[serde(rename = "flowId")]
    pub flow_id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "reqLabel")]
    pub req_label: Option<String>,
    pub source: String,

    #[serde(rename = "rawHttpBlock")]
    pub raw_http_block: String,
    pub method: String,
    #[serde(rename = "urlTemplate")]
    pub url_template: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "urlResolved")]
    pub url_resolved: Option<String>,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "bodyPreview")]
    pub body_preview: Option<String>,

    pub timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
    #[serde(rename = "pluginHooks", default)]
    pub plugin_hooks: Vec<PluginHookRecord>,
    #[serde(rename = "pluginReports", default)]
    pub plugin_reports: Vec<PluginReport>,

    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Latch ensuring `executionFailed` is emitted at most once (spec §8 inv. 4).
    #[serde(skip)]
    pub failure_emitted: bool,
}

pub const BODY_PREVIEW_LIMIT: usize = 1000;

impl StoredExecution {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ExecStatus::Success | ExecStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: DateTime<Utc>,
    #[serde(rename = "wsSessionId")]
    pub ws_session_id: String,
    pub seq: u64,
    pub payload: Value,
}

/// Mutable per-connection state owned by the WS Session Manager (spec §3, §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct WsSessionSnapshot {
    #[serde(rename = "wsSessionId")]
    pub ws_session_id: String,
    #[serde(rename = "upstreamUrl")]
    pub upstream_url: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "flowId")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "reqExecId")]
    pub req_exec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: DateTime<Utc>,
    #[serde(rename = "readyState")]
    pub ready_state: ReadyState,
    #[serde(rename = "idleTimeoutMs")]
    pub idle_timeout_ms: u64,
    #[serde(rename = "replayBufferSize")]
    pub replay_buffer_size: usize,
    #[serde(rename = "maxFrameBytes")]
    pub max_frame_bytes: usize,
    #[serde(rename = "lastSeq")]
    pub last_seq: u64,
}

/// Wire form of a bus/SSE/WS event (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: DateTime<Utc>,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "flowId")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "reqExecId")]
    pub req_exec_id: Option<String>,
    pub seq: u64,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(kind: impl Into<String>, ts: DateTime<Utc>, run_id: impl Into<String>, seq: u64, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            ts,
            run_id: run_id.into(),
            session_id: None,
            flow_id: None,
            req_exec_id: None,
            seq,
            payload,
        }
    }
}
