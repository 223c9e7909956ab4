//! Script & Test Runner: spawns child processes holding a scoped short-lived
//! token, streams stdout/stderr as flow events (`scriptOutput`/`testOutput`).
//!
//! The spawn-and-multiplex shape is grounded on
//! `cthulu-backend/sandbox/local_host/process_supervisor.rs`'s
//! `exec_stream`: stdout/stderr each get their own line-reading task feeding
//! a shared channel, a third task awaits the child and emits a terminal
//! event once the readers have drained. Unlike the teacher, output here goes
//! straight to the Event Bus/Flow Manager as envelopes instead of a
//! caller-owned channel, and cancellation is exposed as a public `cancel`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::flow::FlowManager;
use crate::ids::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Script,
    Test,
}

impl RunKind {
    fn started_event(self) -> &'static str {
        match self {
            RunKind::Script => "scriptStarted",
            RunKind::Test => "testStarted",
        }
    }
    fn output_event(self) -> &'static str {
        match self {
            RunKind::Script => "scriptOutput",
            RunKind::Test => "testOutput",
        }
    }
    fn finished_event(self) -> &'static str {
        match self {
            RunKind::Script => "scriptFinished",
            RunKind::Test => "testFinished",
        }
    }
}

pub struct RunRequest {
    pub kind: RunKind,
    pub command: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    pub env: HashMap<String, String>,
    pub flow_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

struct RunningEntry {
    abort: tokio::sync::oneshot::Sender<()>,
    token: String,
}

struct ScopedToken {
    expires_at: DateTime<Utc>,
}

/// Table of in-flight script/test runs plus the scoped-token registry that
/// gates requests a spawned child makes back into the control plane.
pub struct ScriptRunner {
    running: Arc<RwLock<HashMap<String, RunningEntry>>>,
    tokens: Arc<RwLock<HashMap<String, ScopedToken>>>,
    flows: Arc<FlowManager>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
    default_timeout_ms: u64,
    max_output_bytes: usize,
    token_ttl_secs: u64,
    env_allowlist: Vec<String>,
}

const SCRIPT_RUNNERS: &[&str] = &["bash", "sh", "node", "python3"];
const TEST_FRAMEWORKS: &[&str] = &["cargo-test", "jest", "pytest"];

impl ScriptRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<FlowManager>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
        default_timeout_ms: u64,
        max_output_bytes: usize,
        token_ttl_secs: u64,
        env_allowlist: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            running: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            flows,
            bus,
            clock,
            max_concurrent,
            default_timeout_ms,
            max_output_bytes,
            token_ttl_secs,
            env_allowlist,
        })
    }

    pub fn script_runners(&self) -> Vec<&'static str> {
        SCRIPT_RUNNERS.to_vec()
    }

    pub fn test_frameworks(&self) -> Vec<&'static str> {
        TEST_FRAMEWORKS.to_vec()
    }

    /// Mints a token good for `script_token_ttl_secs`, handed to the child
    /// via env so it can call back into the control plane scoped to this run.
    async fn mint_token(&self) -> String {
        let token = new_id();
        let expires_at = self.clock.now() + chrono::Duration::seconds(self.token_ttl_secs as i64);
        self.tokens.write().await.insert(token.clone(), ScopedToken { expires_at });
        token
    }

    pub async fn validate_token(&self, token: &str) -> bool {
        let tokens = self.tokens.read().await;
        match tokens.get(token) {
            Some(scoped) => scoped.expires_at > self.clock.now(),
            None => false,
        }
    }

    async fn revoke_token(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Spawns the command, returns its `runId` immediately; output streams
    /// as flow events for as long as a `flowId` is given (a script/test run
    /// with no flow still executes, but its output has nowhere durable to
    /// land besides the run-scoped event bus channel).
    pub async fn spawn(&self, req: RunRequest) -> Result<String, ApiError> {
        if req.command.is_empty() {
            return Err(ApiError::ValidationError("command must not be empty".to_string()));
        }
        {
            let running = self.running.read().await;
            if running.len() >= self.max_concurrent {
                return Err(ApiError::ValidationError("too many concurrent script/test runs".to_string()));
            }
        }

        let run_id = new_id();
        let token = self.mint_token().await;

        let mut cmd = Command::new(&req.command[0]);
        cmd.args(&req.command[1..]);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env_clear();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        for (k, v) in &req.env {
            cmd.env(k, v);
        }
        cmd.env("REQRUNNER_SCRIPT_TOKEN", &token);
        cmd.env("REQRUNNER_RUN_ID", &run_id);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ApiError::Execute(format!("spawn failed: {e}")))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (abort_tx, abort_rx) = tokio::sync::oneshot::channel();
        self.running
            .write()
            .await
            .insert(run_id.clone(), RunningEntry { abort: abort_tx, token: token.clone() });
        let this_running = self.running.clone();
        let this_tokens = self.tokens.clone();

        let kind = req.kind;
        let flow_id = req.flow_id.clone();
        let timeout_ms = req.timeout_ms.unwrap_or(self.default_timeout_ms);
        let max_output_bytes = self.max_output_bytes;

        self.emit(&flow_id, &run_id, kind.started_event(), json!({ "command": req.command })).await;

        let this_flows = self.flows.clone();
        let this_bus = self.bus.clone();

        tokio::spawn(async move {
            let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<(&'static str, String)>(256);

            let out_tx_stdout = out_tx.clone();
            let stdout_task = tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                let mut sent_bytes = 0usize;
                while let Ok(Some(line)) = reader.next_line().await {
                    sent_bytes += line.len();
                    if sent_bytes > max_output_bytes {
                        break;
                    }
                    if out_tx_stdout.send(("stdout", line)).await.is_err() {
                        break;
                    }
                }
            });

            let out_tx_stderr = out_tx.clone();
            let stderr_task = tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                let mut sent_bytes = 0usize;
                while let Ok(Some(line)) = reader.next_line().await {
                    sent_bytes += line.len();
                    if sent_bytes > max_output_bytes {
                        break;
                    }
                    if out_tx_stderr.send(("stderr", line)).await.is_err() {
                        break;
                    }
                }
            });
            drop(out_tx);

            let relay_flow_id = flow_id.clone();
            let relay_run_id = run_id.clone();
            let relay_flows = this_flows.clone();
            let relay_bus = this_bus.clone();
            let relay_task = tokio::spawn(async move {
                while let Some((stream, line)) = out_rx.recv().await {
                    emit_static(&relay_flows, &relay_bus, &relay_flow_id, &relay_run_id, kind.output_event(), json!({ "stream": stream, "line": line })).await;
                }
            });

            let wait_result = tokio::select! {
                status = child.wait() => Some(status),
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    let _ = child.kill().await;
                    None
                }
                _ = abort_rx => {
                    let _ = child.kill().await;
                    None
                }
            };

            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = relay_task.await;

            let (exit_code, timed_out) = match wait_result {
                Some(Ok(status)) => (status.code(), false),
                Some(Err(_)) => (None, false),
                None => (None, true),
            };

            emit_static(
                &this_flows,
                &this_bus,
                &flow_id,
                &run_id,
                kind.finished_event(),
                json!({ "exitCode": exit_code, "timedOut": timed_out }),
            )
            .await;

            this_running.write().await.remove(&run_id);
            this_tokens.write().await.remove(&token);
        });

        Ok(run_id)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<(), ApiError> {
        let entry = {
            let mut running = self.running.write().await;
            running.remove(run_id).ok_or_else(|| ApiError::ExecutionNotFound(run_id.to_string()))?
        };
        self.tokens.write().await.remove(&entry.token);
        let _ = entry.abort.send(());
        Ok(())
    }

    async fn emit(&self, flow_id: &Option<String>, run_id: &str, kind: &str, payload: serde_json::Value) {
        emit_static(&self.flows, &self.bus, flow_id, run_id, kind, payload).await;
    }
}

async fn emit_static(
    flows: &Arc<FlowManager>,
    bus: &Arc<EventBus>,
    flow_id: &Option<String>,
    run_id: &str,
    kind: &str,
    payload: serde_json::Value,
) {
    match flow_id {
        Some(flow_id) => {
            if let Ok(envelope) = flows.emit_event(flow_id, run_id, None, kind, payload).await {
                bus.emit_envelope(envelope).await;
            }
        }
        None => {
            bus.emit_run_scoped(None, run_id, kind, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn runner() -> Arc<ScriptRunner> {
        let clock = Arc::new(SystemClock);
        let sessions = crate::session::SessionManager::new(clock.clone(), 10, 1800);
        let flows = FlowManager::new(clock.clone(), sessions, 10, 500, 300);
        let bus = EventBus::new(clock.clone());
        ScriptRunner::new(flows, bus, clock, 4, 5_000, 1024 * 1024, 900, vec!["PATH".to_string()])
    }

    #[tokio::test]
    async fn spawn_echo_emits_started_and_finished() {
        let runner = runner();
        let (_id, mut rx) = runner.bus.subscribe(None, None).await;
        let run_id = runner
            .spawn(RunRequest {
                kind: RunKind::Script,
                command: vec!["echo".to_string(), "hi".to_string()],
                cwd: None,
                env: HashMap::new(),
                flow_id: None,
                timeout_ms: None,
            })
            .await
            .unwrap();

        let started = rx.recv().await.unwrap();
        assert_eq!(started.kind, "scriptStarted");
        assert_eq!(started.run_id, run_id);

        let mut saw_output = false;
        let mut saw_finished = false;
        for _ in 0..5 {
            let envelope = rx.recv().await.unwrap();
            if envelope.kind == "scriptOutput" {
                saw_output = true;
            }
            if envelope.kind == "scriptFinished" {
                saw_finished = true;
                assert_eq!(envelope.payload["exitCode"], 0);
                break;
            }
        }
        assert!(saw_output);
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let runner = runner();
        let err = runner
            .spawn(RunRequest { kind: RunKind::Script, command: vec![], cwd: None, env: HashMap::new(), flow_id: None, timeout_ms: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }

    #[tokio::test]
    async fn mint_and_validate_token_roundtrip() {
        let runner = runner();
        let token = runner.mint_token().await;
        assert!(runner.validate_token(&token).await);
        runner.revoke_token(&token).await;
        assert!(!runner.validate_token(&token).await);
    }

    #[tokio::test]
    async fn unknown_run_cancel_errors() {
        let runner = runner();
        let err = runner.cancel("missing").await.unwrap_err();
        assert!(matches!(err, ApiError::ExecutionNotFound(_)));
    }
}
