//! HTTP Execution Engine (spec §4.3): orchestrates one execution — plugin
//! hooks, interpolation, dispatch, response capture, retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::{json, Value};

use crate::clock::Clock;
use crate::config::ConfigResolver;
use crate::content_loader::{is_path_safe, ContentLoader};
use crate::cookie::{CookieJar, JarLockRegistry};
use crate::error::ApiError;
use crate::events::EventBus;
use crate::flow::FlowManager;
use crate::ids::new_id;
use crate::interpolate::{interpolate, ResolverRegistry};
use crate::model::{
    BodyEncoding, CapturedResponse, CookieMode, ExecStatus, ParsedRequest, PluginHookRecord, PluginReport, Protocol,
    ResolvedConfig, StoredExecution, Timing, BODY_PREVIEW_LIMIT,
};
use crate::parser::RequestParser;
use crate::plugin::{HookStage, PluginHost};
use crate::redact::redact_headers;
use crate::session::{Session, SessionManager};

const DEFAULT_MAX_RETRIES: u32 = 3;
const BINARY_SNIFF_WINDOW: usize = 8 * 1024;

#[derive(Debug, Default, Clone)]
pub struct ExecuteInput {
    pub flow_id: Option<String>,
    pub session_id: Option<String>,
    pub content: Option<String>,
    pub path: Option<String>,
    pub base_path: Option<String>,
    pub name: Option<String>,
    pub index: Option<usize>,
    pub variables: Option<BTreeMap<String, String>>,
    pub profile: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub method: String,
    #[serde(rename = "urlTemplate")]
    pub url_template: String,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "bodyPreview")]
    pub body_preview: Option<String>,
}

/// Result of `ExecutionEngine::prepare_sse_request`: everything
/// `execute_sse` needs to forward the upstream request.
#[derive(Debug, Clone)]
pub struct PreparedSseRequest {
    pub run_id: String,
    pub protocol: Protocol,
    #[allow(dead_code)]
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Limits {
    #[serde(rename = "maxBodyBytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "reqExecId")]
    pub req_exec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "flowId")]
    pub flow_id: Option<String>,
    pub request: RequestSummary,
    pub resolved: ResolvedConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
    pub limits: Limits,
    pub timing: Timing,
    #[serde(rename = "pluginReports")]
    pub plugin_reports: Vec<PluginReport>,
}

pub struct ExecutionEngine {
    parser: Arc<dyn RequestParser>,
    config_resolver: Arc<dyn ConfigResolver>,
    content_loader: Arc<ContentLoader>,
    sessions: Arc<SessionManager>,
    flows: Arc<FlowManager>,
    events: Arc<EventBus>,
    plugins: Arc<PluginHost>,
    resolvers: Arc<ResolverRegistry>,
    jar_locks: Arc<JarLockRegistry>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parser: Arc<dyn RequestParser>,
        config_resolver: Arc<dyn ConfigResolver>,
        content_loader: Arc<ContentLoader>,
        sessions: Arc<SessionManager>,
        flows: Arc<FlowManager>,
        events: Arc<EventBus>,
        plugins: Arc<PluginHost>,
        resolvers: Arc<ResolverRegistry>,
        jar_locks: Arc<JarLockRegistry>,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            parser,
            config_resolver,
            content_loader,
            sessions,
            flows,
            events,
            plugins,
            resolvers,
            jar_locks,
            http,
            clock,
        }
    }

    pub async fn execute(&self, input: ExecuteInput) -> Result<ExecuteResponse, ApiError> {
        let run_id = new_id();
        let start_time = self.clock.now();
        let span = tracing::info_span!("execute", run_id = %run_id, flow_id = input.flow_id.as_deref().unwrap_or(""));
        let _enter = span.enter();

        if let Some(flow_id) = &input.flow_id {
            if !self.flows.exists(flow_id).await {
                return Err(ApiError::FlowNotFound(flow_id.clone()));
            }
        }
        let req_exec_id = input.flow_id.as_ref().map(|_| new_id());

        let loaded = self.content_loader.load(input.content.as_deref(), input.path.as_deref(), input.base_path.as_deref()).await?;
        let parsed_requests = self.parser.parse(&loaded.text).await.map_err(|e| ApiError::Parse(e.to_string()))?;
        if parsed_requests.is_empty() {
            return Err(ApiError::NoRequestsFound);
        }

        let mut report_seq = 0u64;
        let parse_after_input = json!({ "requestCount": parsed_requests.len() });
        let parse_after_result = self
            .plugins
            .dispatch(
                HookStage::ParseAfter,
                &parse_after_input,
                None,
                &run_id,
                input.flow_id.as_deref(),
                req_exec_id.as_deref(),
                None,
                &mut report_seq,
            )
            .await;
        let mut run_reports: Vec<PluginReport> = parse_after_result.reports;

        let selected = select_request(&parsed_requests, input.name.as_deref(), input.index)?;

        let validate_input = json!({ "method": selected.method, "url": selected.url });
        let validate_result = self
            .plugins
            .dispatch(
                HookStage::Validate,
                &validate_input,
                None,
                &run_id,
                input.flow_id.as_deref(),
                req_exec_id.as_deref(),
                selected.name.as_deref(),
                &mut report_seq,
            )
            .await;
        run_reports.extend(validate_result.reports);

        let mut run_hooks = parse_after_result.hooks;
        run_hooks.extend(validate_result.hooks);

        let mut retries: u32 = 0;
        let max_retries = input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        let mut req_exec_state: Option<StoredExecution> = if let Some(flow_id) = &input.flow_id {
            let exec_id = req_exec_id.clone().expect("reqExecId minted when flowId present");
            let initial = StoredExecution {
                req_exec_id: exec_id,
                flow_id: flow_id.clone(),
                session_id: input.session_id.clone(),
                req_label: selected.name.clone(),
                source: input.path.clone().unwrap_or_else(|| "inline".to_string()),
                raw_http_block: selected.raw.clone(),
                method: selected.method.clone(),
                url_template: selected.url.clone(),
                url_resolved: None,
                headers: selected.headers.clone(),
                body_preview: selected.body.as_ref().map(|b| truncate_preview(b, BODY_PREVIEW_LIMIT)),
                timing: Timing::starting_at(start_time),
                response: None,
                plugin_hooks: run_hooks.clone(),
                plugin_reports: run_reports.clone(),
                status: ExecStatus::Pending,
                error: None,
                failure_emitted: false,
            };
            self.flows.store_execution(flow_id, initial.clone()).await?;
            self.emit(flow_id.as_str(), &run_id, req_exec_id.as_deref(), input.session_id.as_deref(), "requestQueued", json!({}))
                .await;
            Some(initial)
        } else {
            None
        };

        loop {
            let outcome = self
                .execute_attempt(
                    &run_id,
                    req_exec_id.as_deref(),
                    &input,
                    selected,
                    retries,
                    max_retries,
                    &mut req_exec_state,
                    run_reports.clone(),
                    run_hooks.clone(),
                    &mut report_seq,
                )
                .await;

            match outcome {
                AttemptOutcome::Retry(delay_ms) => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    continue;
                }
                AttemptOutcome::Done(result) => return result,
            }
        }
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Spec §4.4: runs steps 1-6 and interpolation without dispatching,
    /// handing the caller back a resolved method/URL/headers/protocol ready
    /// to stream through `sse_exec::execute_sse`.
    pub async fn prepare_sse_request(&self, input: &ExecuteInput) -> Result<PreparedSseRequest, ApiError> {
        let run_id = new_id();
        let loaded = self.content_loader.load(input.content.as_deref(), input.path.as_deref(), input.base_path.as_deref()).await?;
        let parsed_requests = self.parser.parse(&loaded.text).await.map_err(|e| ApiError::Parse(e.to_string()))?;
        if parsed_requests.is_empty() {
            return Err(ApiError::NoRequestsFound);
        }
        let selected = select_request(&parsed_requests, input.name.as_deref(), input.index)?;

        let session_vars = if let Some(session_id) = &input.session_id {
            Some(self.sessions.get(session_id).await?.variables)
        } else {
            None
        };
        let resolved = self
            .config_resolver
            .resolve(input.profile.as_deref(), session_vars.as_ref(), input.variables.as_ref())
            .await
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;

        let url = interpolate(&selected.url, &resolved.variables, &self.resolvers).await;
        let mut headers = Vec::with_capacity(selected.headers.len());
        for (name, value) in &selected.headers {
            headers.push((name.clone(), interpolate(value, &resolved.variables, &self.resolvers).await));
        }

        Ok(PreparedSseRequest {
            run_id,
            protocol: selected.protocol,
            method: selected.method.clone(),
            url,
            headers,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_attempt(
        &self,
        run_id: &str,
        req_exec_id: Option<&str>,
        input: &ExecuteInput,
        selected: &ParsedRequest,
        retries: u32,
        max_retries: u32,
        stored: &mut Option<StoredExecution>,
        base_reports: Vec<PluginReport>,
        base_hooks: Vec<PluginHookRecord>,
        report_seq: &mut u64,
    ) -> AttemptOutcome {
        let session_vars = if let Some(session_id) = &input.session_id {
            match self.sessions.get(session_id).await {
                Ok(snapshot) => Some(snapshot.variables),
                Err(e) => return AttemptOutcome::Done(Err(e)),
            }
        } else {
            None
        };

        let resolved = match self
            .config_resolver
            .resolve(input.profile.as_deref(), session_vars.as_ref(), input.variables.as_ref())
            .await
        {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Done(Err(ApiError::ValidationError(e.to_string()))),
        };

        let timeout_ms = crate::config::clamp_timeout(input.timeout_ms, resolved.timeout_ms);

        let url = interpolate(&selected.url, &resolved.variables, &self.resolvers).await;
        let mut headers = Vec::with_capacity(selected.headers.len());
        for (name, value) in &selected.headers {
            headers.push((name.clone(), interpolate(value, &resolved.variables, &self.resolvers).await));
        }
        let body = match (&selected.body, &selected.body_file) {
            (Some(b), _) => Some(interpolate(b, &resolved.variables, &self.resolvers).await),
            (None, Some(body_file)) => {
                let candidate = std::path::PathBuf::from(body_file);
                if !is_path_safe(self.content_loader.workspace_root(), &candidate) {
                    return AttemptOutcome::Done(Err(ApiError::PathOutsideWorkspace(body_file.clone())));
                }
                let full = self.content_loader.workspace_root().join(&candidate);
                let text = match tokio::fs::read_to_string(&full).await {
                    Ok(text) => text,
                    Err(_) => return AttemptOutcome::Done(Err(ApiError::FileNotFound(body_file.clone()))),
                };
                Some(interpolate(&text, &resolved.variables, &self.resolvers).await)
            }
            (None, None) => None,
        };

        let compiled_input = json!({
            "method": selected.method,
            "url": url,
            "headers": headers,
        });
        let compile_result = self
            .plugins
            .dispatch(
                HookStage::RequestCompiled,
                &compiled_input,
                None,
                run_id,
                input.flow_id.as_deref(),
                req_exec_id,
                selected.name.as_deref(),
                report_seq,
            )
            .await;

        let before_input = json!({ "method": selected.method, "url": url });
        let before_result = self
            .plugins
            .dispatch(
                HookStage::RequestBefore,
                &before_input,
                None,
                run_id,
                input.flow_id.as_deref(),
                req_exec_id,
                selected.name.as_deref(),
                report_seq,
            )
            .await;

        let mut all_reports: Vec<PluginReport> = base_reports;
        all_reports.extend(compile_result.reports);
        all_reports.extend(before_result.reports);

        let mut all_hooks: Vec<PluginHookRecord> = base_hooks;
        all_hooks.extend(compile_result.hooks);
        all_hooks.extend(before_result.hooks);

        if before_result.skip {
            let max_body_bytes = resolved.max_body_bytes;
            return AttemptOutcome::Done(Ok(ExecuteResponse {
                run_id: run_id.to_string(),
                req_exec_id: req_exec_id.map(str::to_string),
                flow_id: input.flow_id.clone(),
                request: RequestSummary {
                    method: selected.method.clone(),
                    url_template: selected.url.clone(),
                    headers: redact_headers(&selected.headers),
                    body_preview: selected.body.as_ref().map(|b| truncate_preview(b, BODY_PREVIEW_LIMIT)),
                },
                resolved,
                response: None,
                limits: Limits { max_body_bytes },
                timing: Timing::starting_at(self.clock.now()),
                plugin_reports: all_reports,
            }));
        }

        if let Some(exec) = stored.as_mut() {
            exec.status = ExecStatus::Running;
        }

        self.emit(
            input.flow_id.as_deref().unwrap_or(""),
            run_id,
            req_exec_id,
            input.session_id.as_deref(),
            "fetchStarted",
            json!({ "url": url }),
        )
        .await;

        let dispatch_result = self
            .dispatch(
                &selected.method,
                &url,
                &headers,
                body.as_deref(),
                input.session_id.as_deref(),
                &resolved,
                timeout_ms,
            )
            .await;

        let request_after_input = json!({ "method": selected.method, "url": url });
        let request_after_result = self
            .plugins
            .dispatch(
                HookStage::RequestAfter,
                &request_after_input,
                None,
                run_id,
                input.flow_id.as_deref(),
                req_exec_id,
                selected.name.as_deref(),
                report_seq,
            )
            .await;
        all_reports.extend(request_after_result.reports);
        all_hooks.extend(request_after_result.hooks);

        match dispatch_result {
            Ok((mut captured, cookies_changed, ttfb_ms)) => {
                if cookies_changed {
                    self.emit(
                        input.flow_id.as_deref().unwrap_or(""),
                        run_id,
                        req_exec_id,
                        input.session_id.as_deref(),
                        "sessionUpdated",
                        json!({ "cookiesChanged": true }),
                    )
                    .await;
                }

                let response_input = json!({ "status": captured.status });
                let mut response_output = Some(serde_json::to_value(&captured).unwrap_or(Value::Null));
                let after_result = self
                    .plugins
                    .dispatch(
                        HookStage::ResponseAfter,
                        &response_input,
                        response_output.take(),
                        run_id,
                        input.flow_id.as_deref(),
                        req_exec_id,
                        selected.name.as_deref(),
                        report_seq,
                    )
                    .await;
                all_reports.extend(after_result.reports);
                all_hooks.extend(after_result.hooks);

                if let Some(retry) = after_result.retry {
                    if retries < max_retries {
                        tracing::info!(reason = retry.reason, retries, "retrying execution");
                        return AttemptOutcome::Retry(retry.delay_ms);
                    }
                }

                self.emit(
                    input.flow_id.as_deref().unwrap_or(""),
                    run_id,
                    req_exec_id,
                    input.session_id.as_deref(),
                    "fetchFinished",
                    json!({ "ttfb": ttfb_ms }),
                )
                .await;

                let end_time = self.clock.now();
                if let Some(exec) = stored.as_mut() {
                    exec.url_resolved = Some(url.clone());
                    exec.response = Some(captured.clone());
                    exec.status = ExecStatus::Success;
                    exec.timing.end_time = Some(end_time);
                    exec.timing.duration_ms = Some((end_time - exec.timing.start_time).num_milliseconds());
                    exec.timing.ttfb = Some(ttfb_ms);
                    exec.plugin_reports = all_reports.clone();
                    exec.plugin_hooks = all_hooks.clone();
                    if let Some(flow_id) = &input.flow_id {
                        if let Err(e) = self.flows.store_execution(flow_id, exec.clone()).await {
                            return AttemptOutcome::Done(Err(e));
                        }
                    }
                }

                captured.headers = redact_headers(&captured.headers);

                AttemptOutcome::Done(Ok(ExecuteResponse {
                    run_id: run_id.to_string(),
                    req_exec_id: req_exec_id.map(str::to_string),
                    flow_id: input.flow_id.clone(),
                    request: RequestSummary {
                        method: selected.method.clone(),
                        url_template: selected.url.clone(),
                        headers: redact_headers(&selected.headers),
                        body_preview: selected.body.as_ref().map(|b| truncate_preview(b, BODY_PREVIEW_LIMIT)),
                    },
                    resolved: resolved.clone(),
                    response: Some(captured),
                    limits: Limits {
                        max_body_bytes: resolved.max_body_bytes,
                    },
                    timing: stored.as_ref().map(|e| e.timing.clone()).unwrap_or_else(|| Timing::starting_at(end_time)),
                    plugin_reports: all_reports,
                }))
            }
            Err(err) => {
                let error_input = json!({ "message": err.to_string() });
                let error_result = self
                    .plugins
                    .dispatch(
                        HookStage::Error,
                        &error_input,
                        None,
                        run_id,
                        input.flow_id.as_deref(),
                        req_exec_id,
                        selected.name.as_deref(),
                        report_seq,
                    )
                    .await;
                all_reports.extend(error_result.reports);
                all_hooks.extend(error_result.hooks);

                if let Some(retry) = error_result.retry {
                    if retries < max_retries {
                        return AttemptOutcome::Retry(retry.delay_ms);
                    }
                }

                let end_time = self.clock.now();
                if let Some(exec) = stored.as_mut() {
                    if !exec.failure_emitted {
                        exec.status = ExecStatus::Failed;
                        exec.error = Some(err.to_string());
                        exec.timing.end_time = Some(end_time);
                        exec.timing.duration_ms = Some((end_time - exec.timing.start_time).num_milliseconds());
                        exec.url_resolved.get_or_insert_with(|| exec.url_template.clone());
                        exec.failure_emitted = true;
                        exec.plugin_reports = all_reports.clone();
                        exec.plugin_hooks = all_hooks.clone();
                        if let Some(flow_id) = &input.flow_id {
                            if let Err(e) = self.flows.store_execution(flow_id, exec.clone()).await {
                                return AttemptOutcome::Done(Err(e));
                            }
                        }
                        self.emit(
                            input.flow_id.as_deref().unwrap_or(""),
                            run_id,
                            req_exec_id,
                            input.session_id.as_deref(),
                            "executionFailed",
                            json!({ "message": err.to_string() }),
                        )
                        .await;
                    }
                }

                AttemptOutcome::Done(Err(err))
            }
        }
    }

    async fn emit(&self, flow_id: &str, run_id: &str, req_exec_id: Option<&str>, session_id: Option<&str>, kind: &str, payload: Value) {
        if flow_id.is_empty() {
            self.events.emit_run_scoped(session_id.map(str::to_string), run_id, kind, payload).await;
            return;
        }
        match self.flows.emit_event(flow_id, run_id, req_exec_id, kind, payload).await {
            Ok(envelope) => self.events.emit_envelope(envelope).await,
            Err(e) => tracing::warn!(error = %e, "failed to stamp flow event"),
        }
    }

    /// Spec §4.3 step 9: selects a dispatch mode by cookie configuration and
    /// performs the HTTP call, capturing headers/body per step 10. The
    /// returned `i64` is time-to-first-byte in milliseconds, measured from
    /// just before the request is built to the moment response headers
    /// arrive (the `request.send()` future resolving, before the body is
    /// streamed).
    async fn dispatch(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
        session_id: Option<&str>,
        resolved: &ResolvedConfig,
        timeout_ms: u64,
    ) -> Result<(CapturedResponse, bool, i64), ApiError> {
        let dispatch_start = self.clock.now();
        let fut = self.dispatch_inner(method, url, headers, body, session_id, resolved, dispatch_start);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ApiError::Timeout),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_inner(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
        session_id: Option<&str>,
        resolved: &ResolvedConfig,
        dispatch_start: DateTime<Utc>,
    ) -> Result<(CapturedResponse, bool, i64), ApiError> {
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| ApiError::ValidationError(e.to_string()))?;
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                header_map.append(name, value);
            }
        }

        let max_body_bytes = resolved.max_body_bytes;

        match resolved.cookies {
            CookieMode::Disabled => {
                let (captured, ttfb_ms) =
                    self.run_request(method, url, header_map, body, None, max_body_bytes, dispatch_start).await?;
                Ok((captured, false, ttfb_ms))
            }
            CookieMode::Persistent => {
                let path = resolved.cookie_jar_path.clone().ok_or_else(|| {
                    ApiError::ValidationError("persistent cookie mode requires cookieJarPath".to_string())
                })?;
                if let Some(session_id) = session_id {
                    self.run_with_session_jar(session_id, method, url, header_map, body, Some(&path), max_body_bytes, dispatch_start)
                        .await
                } else {
                    self.run_with_persistent_jar(&path, method, url, header_map, body, max_body_bytes, dispatch_start).await
                }
            }
            CookieMode::Memory => {
                if let Some(session_id) = session_id {
                    self.run_with_session_jar(session_id, method, url, header_map, body, None, max_body_bytes, dispatch_start)
                        .await
                } else {
                    let mut jar = CookieJar::default();
                    let (captured, ttfb_ms) = self
                        .run_request_with_jar(method, url, header_map, body, &mut jar, max_body_bytes, dispatch_start)
                        .await?;
                    Ok((captured, false, ttfb_ms))
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&str>,
        cookie_header: Option<String>,
        max_body_bytes: usize,
        dispatch_start: DateTime<Utc>,
    ) -> Result<(CapturedResponse, i64), ApiError> {
        let mut request = self.http.request(method, url).headers(headers);
        if let Some(cookie) = cookie_header {
            if !cookie.is_empty() {
                request = request.header(reqwest::header::COOKIE, cookie);
            }
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        let response = request.send().await.map_err(|e| ApiError::Execute(e.to_string()))?;
        let ttfb_ms = (self.clock.now() - dispatch_start).num_milliseconds();
        let captured = capture_response(response, max_body_bytes).await?;
        Ok((captured, ttfb_ms))
    }

    /// Returns the captured response and whether any cookie value actually
    /// changed (spec §4.3 step 11 bookkeeping).
    #[allow(clippy::too_many_arguments)]
    async fn run_request_with_jar(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&str>,
        jar: &mut CookieJar,
        max_body_bytes: usize,
        dispatch_start: DateTime<Utc>,
    ) -> Result<(CapturedResponse, i64), ApiError> {
        let cookie_header = jar.to_header_value();
        let mut request = self.http.request(method, url).headers(headers);
        if !cookie_header.is_empty() {
            request = request.header(reqwest::header::COOKIE, cookie_header);
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        let response = request.send().await.map_err(|e| ApiError::Execute(e.to_string()))?;
        let ttfb_ms = (self.clock.now() - dispatch_start).num_milliseconds();
        let set_cookie: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let captured = capture_response(response, max_body_bytes).await?;
        jar.apply_set_cookie_headers(&set_cookie);
        Ok((captured, ttfb_ms))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with_persistent_jar(
        &self,
        path: &std::path::Path,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&str>,
        max_body_bytes: usize,
        dispatch_start: DateTime<Utc>,
    ) -> Result<(CapturedResponse, bool, i64), ApiError> {
        let lock = self.jar_locks.lock_for(path).await;
        let _guard = lock.lock().await;

        let mut jar = CookieJar::load(path).await.map_err(|e| ApiError::Execute(e.to_string()))?;
        let (captured, ttfb_ms) =
            self.run_request_with_jar(method, url, headers, body, &mut jar, max_body_bytes, dispatch_start).await?;
        jar.save(path).await.map_err(|e| ApiError::Execute(e.to_string()))?;
        Ok((captured, false, ttfb_ms))
    }

    /// Spec §4.3 step 9 "in a session": acquires the session mutex, reloads
    /// under the jar-path lock if the bound path changed, then uses a
    /// passthrough cookie store that records whether any `Set-Cookie` was
    /// observed so the caller can bump `snapshotVersion`.
    #[allow(clippy::too_many_arguments)]
    async fn run_with_session_jar(
        &self,
        session_id: &str,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&str>,
        persistent_path: Option<&std::path::Path>,
        max_body_bytes: usize,
        dispatch_start: DateTime<Utc>,
    ) -> Result<(CapturedResponse, bool, i64), ApiError> {
        if let Some(path) = persistent_path {
            let lock = self.jar_locks.lock_for(path).await;
            let _guard = lock.lock().await;
            let reloaded = CookieJar::load(path).await.ok();

            self.sessions
                .with_session_lock(session_id, |session: &mut Session| {
                    if let Some(reloaded) = reloaded {
                        if session.cookie_jar_path.as_deref() != Some(path) {
                            session.cookie_jar = reloaded;
                            session.cookie_jar_path = Some(path.to_path_buf());
                        }
                    }
                })
                .await?;
        }

        let cookie_header = self
            .sessions
            .with_session_lock(session_id, |session: &mut Session| session.cookie_jar.to_header_value())
            .await?;

        let mut request = self.http.request(method, url).headers(headers);
        if !cookie_header.is_empty() {
            request = request.header(reqwest::header::COOKIE, cookie_header);
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        let response = request.send().await.map_err(|e| ApiError::Execute(e.to_string()))?;
        let ttfb_ms = (self.clock.now() - dispatch_start).num_milliseconds();
        let set_cookie: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let captured = capture_response(response, max_body_bytes).await?;

        let mut changed = false;
        if !set_cookie.is_empty() {
            changed = self
                .sessions
                .with_session_lock(session_id, |session: &mut Session| {
                    session.cookie_jar.apply_set_cookie_headers(&set_cookie)
                })
                .await?;
            if changed {
                self.sessions.bump_snapshot_version(session_id).await?;
            }
        }

        if let Some(path) = persistent_path {
            let lock = self.jar_locks.lock_for(path).await;
            let _guard = lock.lock().await;
            let jar_snapshot = self
                .sessions
                .with_session_lock(session_id, |session: &mut Session| session.cookie_jar.clone())
                .await?;
            jar_snapshot.save(path).await.map_err(|e| ApiError::Execute(e.to_string()))?;
        }

        Ok((captured, changed, ttfb_ms))
    }
}

enum AttemptOutcome {
    Retry(u64),
    Done(Result<ExecuteResponse, ApiError>),
}

fn select_request<'a>(
    requests: &'a [ParsedRequest],
    name: Option<&str>,
    index: Option<usize>,
) -> Result<&'a ParsedRequest, ApiError> {
    if name.is_some() && index.is_some() {
        return Err(ApiError::ValidationError("specify either name or index, not both".to_string()));
    }
    if let Some(name) = name {
        return requests
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
            .ok_or_else(|| ApiError::RequestNotFound(name.to_string()));
    }
    let index = index.unwrap_or(0);
    requests.get(index).ok_or_else(|| ApiError::RequestIndexOutOfRange {
        index,
        len: requests.len(),
    })
}

fn truncate_preview(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Spec §4.3 step 10: stream-reads up to `max_body_bytes`, sniffs the first
/// 8 KiB for binary content, and flattens headers to lowercase `{name,value}`
/// pairs preserving order and multi-value `Set-Cookie`.
async fn capture_response(response: reqwest::Response, max_body_bytes: usize) -> Result<CapturedResponse, ApiError> {
    use futures::StreamExt;

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("").to_string();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_lowercase(), value.to_str().unwrap_or("").to_string()))
        .collect();

    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::Execute(e.to_string()))?;
        if buffer.len() + chunk.len() > max_body_bytes {
            let remaining = max_body_bytes.saturating_sub(buffer.len());
            buffer.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
            truncated = true;
            break;
        }
        buffer.extend_from_slice(&chunk);
    }

    let body_bytes = buffer.len();
    let sniff_window = &buffer[..buffer.len().min(BINARY_SNIFF_WINDOW)];
    let is_binary = sniff_window.contains(&0u8) || std::str::from_utf8(sniff_window).is_err();

    let (body, encoding) = if is_binary {
        (base64::engine::general_purpose::STANDARD.encode(&buffer), BodyEncoding::Base64)
    } else {
        (String::from_utf8_lossy(&buffer).into_owned(), BodyEncoding::Utf8)
    };

    Ok(CapturedResponse {
        status: status.as_u16(),
        status_text,
        headers,
        body,
        encoding,
        truncated,
        body_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    fn sample_requests() -> Vec<ParsedRequest> {
        vec![
            ParsedRequest {
                name: Some("first".to_string()),
                method: "GET".to_string(),
                url: "https://example.com/a".to_string(),
                headers: Vec::new(),
                body: None,
                body_file: None,
                form_data: None,
                protocol: Protocol::Http,
                protocol_options: None,
                meta: BTreeMap::new(),
                raw: "GET https://example.com/a".to_string(),
            },
            ParsedRequest {
                name: Some("second".to_string()),
                method: "GET".to_string(),
                url: "https://example.com/b".to_string(),
                headers: Vec::new(),
                body: None,
                body_file: None,
                form_data: None,
                protocol: Protocol::Http,
                protocol_options: None,
                meta: BTreeMap::new(),
                raw: "GET https://example.com/b".to_string(),
            },
        ]
    }

    #[test]
    fn select_by_name_finds_exact_match() {
        let requests = sample_requests();
        let selected = select_request(&requests, Some("second"), None).unwrap();
        assert_eq!(selected.url, "https://example.com/b");
    }

    #[test]
    fn select_defaults_to_index_zero() {
        let requests = sample_requests();
        let selected = select_request(&requests, None, None).unwrap();
        assert_eq!(selected.url, "https://example.com/a");
    }

    #[test]
    fn select_both_name_and_index_is_rejected() {
        let requests = sample_requests();
        let err = select_request(&requests, Some("first"), Some(0)).unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }

    #[test]
    fn select_out_of_range_index_is_distinct_error() {
        let requests = sample_requests();
        let err = select_request(&requests, None, Some(5)).unwrap_err();
        assert!(matches!(err, ApiError::RequestIndexOutOfRange { index: 5, len: 2 }));
    }

    #[test]
    fn select_unknown_name_is_request_not_found() {
        let requests = sample_requests();
        let err = select_request(&requests, Some("missing"), None).unwrap_err();
        assert!(matches!(err, ApiError::RequestNotFound(_)));
    }

    #[test]
    fn truncate_preview_respects_char_boundaries() {
        let body = "héllo world";
        let truncated = truncate_preview(body, 2);
        assert!(body.starts_with(&truncated));
    }
}
