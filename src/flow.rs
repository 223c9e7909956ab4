//! Flow Manager (spec §4.2): logical grouping of executions with bounded
//! retention, replayable sequence numbers, and summary statistics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::ApiError;
use crate::ids::new_id;
use crate::model::{EventEnvelope, ExecStatus, StoredExecution};
use crate::redact::redact_headers;
use crate::session::SessionManager;

pub struct Flow {
    pub id: String,
    pub session_id: Option<String>,
    pub label: Option<String>,
    pub meta: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub finished: bool,
    /// Insertion order preserved for oldest-first eviction by `startTime`.
    pub executions: VecDeque<StoredExecution>,
    /// Flow-scoped monotonic counter (spec §3, §4.2, testable property 1).
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishResult {
    #[serde(rename = "flowId")]
    pub flow_id: String,
    pub summary: FlowSummary,
}

pub struct FlowManager {
    flows: RwLock<HashMap<String, Flow>>,
    clock: Arc<dyn Clock>,
    sessions: Arc<SessionManager>,
    max_flows: usize,
    max_executions_per_flow: usize,
    idle_secs: u64,
}

const MAX_META_KEYS: usize = 10;

impl FlowManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        sessions: Arc<SessionManager>,
        max_flows: usize,
        max_executions_per_flow: usize,
        idle_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: RwLock::new(HashMap::new()),
            clock,
            sessions,
            max_flows,
            max_executions_per_flow,
            idle_secs,
        })
    }

    /// Spec §4.2: validates `meta` key count, validates `sessionId` against
    /// the provided existence check, evicts the oldest *finished* flow when
    /// full, fails `FlowLimitReached` if none is finished.
    pub async fn create(
        &self,
        session_id: Option<String>,
        label: Option<String>,
        meta: BTreeMap<String, String>,
    ) -> Result<String, ApiError> {
        if meta.len() > MAX_META_KEYS {
            return Err(ApiError::ValidationError(format!(
                "meta may have at most {MAX_META_KEYS} keys"
            )));
        }
        if let Some(session_id) = &session_id {
            if !self.sessions.exists(session_id).await {
                return Err(ApiError::SessionNotFound(session_id.clone()));
            }
        }

        let mut flows = self.flows.write().await;
        if flows.len() >= self.max_flows {
            let oldest_finished = flows
                .values()
                .filter(|f| f.finished)
                .min_by_key(|f| f.last_activity_at)
                .map(|f| f.id.clone());
            match oldest_finished {
                Some(id) => {
                    flows.remove(&id);
                }
                None => return Err(ApiError::FlowLimitReached),
            }
        }

        let now = self.clock.now();
        let id = new_id();
        flows.insert(
            id.clone(),
            Flow {
                id: id.clone(),
                session_id,
                label,
                meta,
                created_at: now,
                last_activity_at: now,
                finished: false,
                executions: VecDeque::new(),
                seq: 0,
            },
        );
        Ok(id)
    }

    /// Spec §4.2: sets `finished=true`, computes summary over terminal
    /// executions. Idempotent: the second call returns the same summary.
    pub async fn finish(&self, flow_id: &str) -> Result<FinishResult, ApiError> {
        let mut flows = self.flows.write().await;
        let flow = flows.get_mut(flow_id).ok_or_else(|| ApiError::FlowNotFound(flow_id.to_string()))?;
        flow.finished = true;
        let summary = compute_summary(flow);
        Ok(FinishResult {
            flow_id: flow.id.clone(),
            summary,
        })
    }

    pub async fn get(&self, flow_id: &str) -> Result<FlowView, ApiError> {
        let flows = self.flows.read().await;
        let flow = flows.get(flow_id).ok_or_else(|| ApiError::FlowNotFound(flow_id.to_string()))?;
        Ok(FlowView::from(flow))
    }

    pub async fn get_execution(&self, flow_id: &str, req_exec_id: &str) -> Result<StoredExecution, ApiError> {
        let flows = self.flows.read().await;
        let flow = flows.get(flow_id).ok_or_else(|| ApiError::FlowNotFound(flow_id.to_string()))?;
        let exec = flow
            .executions
            .iter()
            .find(|e| e.req_exec_id == req_exec_id)
            .ok_or_else(|| ApiError::ExecutionNotFound(req_exec_id.to_string()))?;
        let mut projection = exec.clone();
        projection.headers = redact_headers(&projection.headers);
        if let Some(response) = projection.response.as_mut() {
            response.headers = redact_headers(&response.headers);
        }
        Ok(projection)
    }

    /// Spec §4.2: on a full flow (≥500), evicts the oldest by `startTime`
    /// before inserting; on update (same `reqExecId` already present),
    /// replaces in place instead of appending.
    pub async fn store_execution(&self, flow_id: &str, exec: StoredExecution) -> Result<(), ApiError> {
        let mut flows = self.flows.write().await;
        let flow = flows.get_mut(flow_id).ok_or_else(|| ApiError::FlowNotFound(flow_id.to_string()))?;
        flow.last_activity_at = self.clock.now();

        if let Some(existing) = flow.executions.iter_mut().find(|e| e.req_exec_id == exec.req_exec_id) {
            *existing = exec;
            return Ok(());
        }

        if flow.executions.len() >= self.max_executions_per_flow {
            flow.executions.pop_front();
        }
        flow.executions.push_back(exec);
        Ok(())
    }

    /// Spec §4.2: stamps a freshly assigned flow-scoped `seq = ++flow.seq`
    /// and current time; order across calls is total within a flow.
    pub async fn emit_event(
        &self,
        flow_id: &str,
        run_id: &str,
        req_exec_id: Option<&str>,
        kind: &str,
        payload: Value,
    ) -> Result<EventEnvelope, ApiError> {
        let mut flows = self.flows.write().await;
        let flow = flows.get_mut(flow_id).ok_or_else(|| ApiError::FlowNotFound(flow_id.to_string()))?;
        flow.seq += 1;
        flow.last_activity_at = self.clock.now();
        let mut envelope = EventEnvelope::new(kind, flow.last_activity_at, run_id, flow.seq, payload);
        envelope.flow_id = Some(flow_id.to_string());
        envelope.session_id = flow.session_id.clone();
        envelope.req_exec_id = req_exec_id.map(str::to_string);
        Ok(envelope)
    }

    pub async fn session_id_of(&self, flow_id: &str) -> Result<Option<String>, ApiError> {
        let flows = self.flows.read().await;
        let flow = flows.get(flow_id).ok_or_else(|| ApiError::FlowNotFound(flow_id.to_string()))?;
        Ok(flow.session_id.clone())
    }

    pub async fn exists(&self, flow_id: &str) -> bool {
        self.flows.read().await.contains_key(flow_id)
    }

    /// Background sweep (spec §4.2: 60 s interval, deletes flows idle > 5 min).
    pub async fn sweep_idle(&self) {
        let mut flows = self.flows.write().await;
        let now = self.clock.now();
        let idle = chrono::Duration::seconds(self.idle_secs as i64);
        let expired: Vec<String> = flows
            .values()
            .filter(|f| now - f.last_activity_at > idle)
            .map(|f| f.id.clone())
            .collect();
        for id in &expired {
            flows.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept idle flows");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                manager.sweep_idle().await;
            }
        });
    }
}

fn compute_summary(flow: &Flow) -> FlowSummary {
    let terminal: Vec<&StoredExecution> = flow.executions.iter().filter(|e| e.is_terminal()).collect();
    let succeeded = terminal.iter().filter(|e| e.status == ExecStatus::Success).count();
    let failed = terminal.iter().filter(|e| e.status == ExecStatus::Failed).count();

    let duration_ms = if terminal.is_empty() {
        0
    } else {
        let earliest = terminal.iter().map(|e| e.timing.start_time).min().unwrap();
        let latest = terminal.iter().filter_map(|e| e.timing.end_time).max();
        latest.map(|end| (end - earliest).num_milliseconds()).unwrap_or(0)
    };

    FlowSummary {
        total: terminal.len(),
        succeeded,
        failed,
        duration_ms,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowView {
    pub id: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub meta: BTreeMap<String, String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: DateTime<Utc>,
    pub finished: bool,
    #[serde(rename = "executionCount")]
    pub execution_count: usize,
    pub seq: u64,
}

impl From<&Flow> for FlowView {
    fn from(flow: &Flow) -> Self {
        Self {
            id: flow.id.clone(),
            session_id: flow.session_id.clone(),
            label: flow.label.clone(),
            meta: flow.meta.clone(),
            created_at: flow.created_at,
            last_activity_at: flow.last_activity_at,
            finished: flow.finished,
            execution_count: flow.executions.len(),
            seq: flow.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::Timing;

    fn manager() -> Arc<FlowManager> {
        FlowManager::new(Arc::new(SystemClock), SessionManager::new(Arc::new(SystemClock), 100, 1800), 100, 500, 300)
    }

    fn sample_execution(id: &str, flow_id: &str, status: ExecStatus) -> StoredExecution {
        StoredExecution {
            req_exec_id: id.to_string(),
            flow_id: flow_id.to_string(),
            session_id: None,
            req_label: None,
            source: "inline".to_string(),
            raw_http_block: "GET https://example.com".to_string(),
            method: "GET".to_string(),
            url_template: "https://example.com".to_string(),
            url_resolved: Some("https://example.com".to_string()),
            headers: vec![("Authorization".to_string(), "Bearer xyz".to_string())],
            body_preview: None,
            timing: Timing::starting_at(Utc::now()),
            response: None,
            plugin_hooks: Vec::new(),
            plugin_reports: Vec::new(),
            status,
            error: None,
            failure_emitted: false,
        }
    }

    #[tokio::test]
    async fn seq_strictly_increases_across_emit_calls() {
        let mgr = manager();
        let flow_id = mgr.create(None, None, BTreeMap::new()).await.unwrap();
        let e1 = mgr.emit_event(&flow_id, "run1", None, "requestQueued", serde_json::json!({})).await.unwrap();
        let e2 = mgr.emit_event(&flow_id, "run1", None, "fetchStarted", serde_json::json!({})).await.unwrap();
        assert!(e1.seq < e2.seq);
    }

    #[tokio::test]
    async fn create_rejects_unknown_session_id() {
        let mgr = manager();
        let err = mgr.create(Some("no-such-session".to_string()), None, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn store_execution_redacts_sensitive_headers_on_read() {
        let mgr = manager();
        let flow_id = mgr.create(None, None, BTreeMap::new()).await.unwrap();
        mgr.store_execution(&flow_id, sample_execution("exec1", &flow_id, ExecStatus::Success)).await.unwrap();
        let projected = mgr.get_execution(&flow_id, "exec1").await.unwrap();
        assert_eq!(projected.headers[0].1, "[REDACTED]");
    }

    #[tokio::test]
    async fn full_flow_evicts_oldest_execution() {
        let mgr = FlowManager::new(Arc::new(SystemClock), SessionManager::new(Arc::new(SystemClock), 100, 1800), 100, 2, 300);
        let flow_id = mgr.create(None, None, BTreeMap::new()).await.unwrap();
        mgr.store_execution(&flow_id, sample_execution("e1", &flow_id, ExecStatus::Success)).await.unwrap();
        mgr.store_execution(&flow_id, sample_execution("e2", &flow_id, ExecStatus::Success)).await.unwrap();
        mgr.store_execution(&flow_id, sample_execution("e3", &flow_id, ExecStatus::Success)).await.unwrap();

        assert!(mgr.get_execution(&flow_id, "e1").await.is_err());
        assert!(mgr.get_execution(&flow_id, "e3").await.is_ok());
    }

    #[tokio::test]
    async fn finish_twice_returns_same_summary() {
        let mgr = manager();
        let flow_id = mgr.create(None, None, BTreeMap::new()).await.unwrap();
        mgr.store_execution(&flow_id, sample_execution("e1", &flow_id, ExecStatus::Success)).await.unwrap();
        let first = mgr.finish(&flow_id).await.unwrap();
        let second = mgr.finish(&flow_id).await.unwrap();
        assert_eq!(first.summary.total, second.summary.total);
        assert_eq!(first.summary.succeeded, second.summary.succeeded);
    }

    #[tokio::test]
    async fn full_table_with_no_finished_flow_fails() {
        let mgr = FlowManager::new(Arc::new(SystemClock), SessionManager::new(Arc::new(SystemClock), 100, 1800), 1, 500, 300);
        mgr.create(None, None, BTreeMap::new()).await.unwrap();
        let err = mgr.create(None, None, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::FlowLimitReached));
    }

    #[tokio::test]
    async fn meta_over_limit_rejected() {
        let mgr = manager();
        let mut meta = BTreeMap::new();
        for i in 0..11 {
            meta.insert(format!("k{i}"), "v".to_string());
        }
        let err = mgr.create(None, None, meta).await.unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }
}
