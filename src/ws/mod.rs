//! WebSocket Session Manager (spec §4.5): proxies an upstream WebSocket
//! connection, exposing a control protocol (`send`/`close`/`replay`) and a
//! bounded replay buffer over the control-plane's own `/ws/session/{id}`.
//!
//! Grounded on `cthulu-backend/api/agents/terminal.rs`'s bidirectional
//! bridge (`socket.split()`, an outbound forwarding task plus an inbound
//! read loop), generalized from a local PTY to a remote upstream socket and
//! from a bespoke resize protocol to the closed envelope set below.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::clock::Clock;
use crate::error::ApiError;
use crate::model::{ReadyState, WsEnvelope, WsSessionSnapshot};

enum OutboundCommand {
    Send(Message),
    Close(Option<u16>, Option<String>),
}

struct WsSession {
    id: String,
    upstream_url: String,
    flow_id: Option<String>,
    req_exec_id: Option<String>,
    subprotocol: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    ready_state: ReadyState,
    idle_timeout_ms: u64,
    replay_buffer_size: usize,
    max_frame_bytes: usize,
    last_seq: u64,
    replay_buffer: VecDeque<WsEnvelope>,
    outbound_tx: mpsc::Sender<OutboundCommand>,
}

impl WsSession {
    fn snapshot(&self) -> WsSessionSnapshot {
        WsSessionSnapshot {
            ws_session_id: self.id.clone(),
            upstream_url: self.upstream_url.clone(),
            flow_id: self.flow_id.clone(),
            req_exec_id: self.req_exec_id.clone(),
            subprotocol: self.subprotocol.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            ready_state: self.ready_state,
            idle_timeout_ms: self.idle_timeout_ms,
            replay_buffer_size: self.replay_buffer_size,
            max_frame_bytes: self.max_frame_bytes,
            last_seq: self.last_seq,
        }
    }
}

struct Entry {
    session: WsSession,
    control_tx: broadcast::Sender<WsEnvelope>,
}

pub struct OpenRequest {
    pub upstream_url: String,
    pub flow_id: Option<String>,
    pub req_exec_id: Option<String>,
    pub subprotocol: Option<String>,
    pub idle_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub replay_buffer_size: usize,
}

pub struct WsSessionManager {
    inner: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    max_sessions: usize,
}

impl WsSessionManager {
    pub fn new(clock: Arc<dyn Clock>, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            clock,
            max_sessions,
        })
    }

    /// Spec §4.5 `open`: rejects at capacity and best-effort closes the
    /// provided upstream with code 1013 rather than leaving it dangling.
    /// `id` is the control-plane session id the caller exposes at
    /// `/ws/session/{id}`; the REST route lets the caller choose it up
    /// front rather than learning it from the response.
    pub async fn open(self: &Arc<Self>, id: String, req: OpenRequest) -> Result<(String, broadcast::Receiver<WsEnvelope>), ApiError> {
        {
            let inner = self.inner.read().await;
            if inner.len() >= self.max_sessions {
                tokio::spawn(best_effort_reject(req.upstream_url.clone()));
                return Err(ApiError::WsSessionLimitReached);
            }
            if inner.contains_key(&id) {
                return Err(ApiError::ValidationError(format!("websocket session {id} already open")));
            }
        }

        let now = self.clock.now();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = broadcast::channel(256);

        let session = WsSession {
            id: id.clone(),
            upstream_url: req.upstream_url.clone(),
            flow_id: req.flow_id,
            req_exec_id: req.req_exec_id,
            subprotocol: req.subprotocol,
            created_at: now,
            last_activity_at: now,
            ready_state: ReadyState::Connecting,
            idle_timeout_ms: req.idle_timeout_ms,
            replay_buffer_size: req.replay_buffer_size.max(1),
            max_frame_bytes: req.max_frame_bytes,
            last_seq: 0,
            replay_buffer: VecDeque::new(),
            outbound_tx,
        };

        self.inner.write().await.insert(id.clone(), Entry { session, control_tx });

        let manager = self.clone();
        let task_id = id.clone();
        let upstream_url = req.upstream_url;
        tokio::spawn(async move {
            manager.run_upstream(task_id, upstream_url, outbound_rx).await;
        });

        Ok((id, control_rx))
    }

    /// Owns the upstream socket for the lifetime of the session. The
    /// manager never touches the socket from any other method — only this
    /// task reads/writes it, matching spec §4.5 "the manager observes only."
    async fn run_upstream(self: Arc<Self>, id: String, upstream_url: String, mut outbound_rx: mpsc::Receiver<OutboundCommand>) {
        use futures::{SinkExt, StreamExt};

        let mut ws_stream = match tokio_tungstenite::connect_async(&upstream_url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                self.emit(&id, "session.error", json!({ "code": "WS_UPSTREAM_CONNECT_FAILED", "message": e.to_string() })).await;
                self.transition(&id, ReadyState::Closed).await;
                self.emit(&id, "session.closed", json!({ "code": 1006, "reason": "connect failed" })).await;
                self.inner.write().await.remove(&id);
                return;
            }
        };

        self.transition(&id, ReadyState::Open).await;
        self.emit(&id, "session.opened", json!({})).await;

        loop {
            tokio::select! {
                inbound = ws_stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.emit(&id, "session.inbound", json!({ "payloadType": "text", "payload": text.as_str() })).await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            self.emit(&id, "session.error", json!({ "code": "WS_BINARY_UNSUPPORTED" })).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, String::new()));
                            self.transition(&id, ReadyState::Closing).await;
                            self.transition(&id, ReadyState::Closed).await;
                            self.emit(&id, "session.closed", json!({ "code": code, "reason": reason })).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.emit(&id, "session.error", json!({ "code": "WS_UPSTREAM_ERROR", "message": e.to_string() })).await;
                        }
                        None => {
                            self.transition(&id, ReadyState::Closed).await;
                            self.emit(&id, "session.closed", json!({ "code": 1006, "reason": "upstream eof" })).await;
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(OutboundCommand::Send(msg)) => {
                            if ws_stream.send(msg).await.is_err() {
                                self.transition(&id, ReadyState::Closed).await;
                                break;
                            }
                        }
                        Some(OutboundCommand::Close(code, reason)) => {
                            let frame = CloseFrame {
                                code: code.unwrap_or(1000).into(),
                                reason: reason.clone().unwrap_or_default().into(),
                            };
                            let _ = ws_stream.close(Some(frame)).await;
                            self.transition(&id, ReadyState::Closed).await;
                            self.emit(&id, "session.closed", json!({
                                "code": code.unwrap_or(1000),
                                "reason": reason.unwrap_or_default(),
                            })).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.inner.write().await.remove(&id);
    }

    async fn transition(&self, id: &str, state: ReadyState) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(id) {
            entry.session.ready_state = state;
        }
    }

    /// Allocates `lastSeq++`, appends to the replay buffer, and fans out to
    /// the control channel. Not used for `session.replay.end` or
    /// replay-scoped `WS_REPLAY_GAP` envelopes (spec §4.5: those are never
    /// persisted, to prevent replay storms) — `replay()` builds those
    /// directly.
    async fn emit(&self, id: &str, kind: &str, payload: Value) {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(id) {
            entry.session.last_seq += 1;
            entry.session.last_activity_at = now;
            let envelope = WsEnvelope {
                kind: kind.to_string(),
                ts: now,
                ws_session_id: id.to_string(),
                seq: entry.session.last_seq,
                payload,
            };
            if entry.session.replay_buffer.len() >= entry.session.replay_buffer_size {
                entry.session.replay_buffer.pop_front();
            }
            entry.session.replay_buffer.push_back(envelope.clone());
            let _ = entry.control_tx.send(envelope);
        }
    }

    /// Spec §4.5 `send`: rejects binary payloads and oversized frames with
    /// an error envelope rather than an API error; only a missing session is
    /// a hard failure.
    pub async fn send(&self, id: &str, payload_type: &str, payload: &Value) -> Result<(), ApiError> {
        let (ready_state, max_frame_bytes, outbound_tx) = {
            let inner = self.inner.read().await;
            let entry = inner.get(id).ok_or_else(|| ApiError::WsSessionNotFound(id.to_string()))?;
            (entry.session.ready_state, entry.session.max_frame_bytes, entry.session.outbound_tx.clone())
        };

        if ready_state != ReadyState::Open {
            self.emit(id, "session.error", json!({ "code": "WS_UPSTREAM_NOT_OPEN" })).await;
            return Ok(());
        }
        if payload_type == "binary" {
            self.emit(id, "session.error", json!({ "code": "WS_BINARY_UNSUPPORTED" })).await;
            return Ok(());
        }

        let text = if payload_type == "json" {
            payload.as_str().map(str::to_string).unwrap_or_else(|| payload.to_string())
        } else {
            payload.as_str().map(str::to_string).unwrap_or_else(|| payload.to_string())
        };

        if text.len() > max_frame_bytes {
            self.emit(id, "session.error", json!({ "code": "WS_FRAME_TOO_LARGE", "size": text.len(), "max": max_frame_bytes })).await;
            return Ok(());
        }

        let _ = outbound_tx.send(OutboundCommand::Send(Message::Text(text.clone().into()))).await;
        self.emit(id, "session.outbound", json!({ "payloadType": payload_type, "payload": text })).await;
        Ok(())
    }

    pub async fn close(&self, id: &str, code: Option<u16>, reason: Option<String>) -> Result<(), ApiError> {
        let outbound_tx = {
            let inner = self.inner.read().await;
            let entry = inner.get(id).ok_or_else(|| ApiError::WsSessionNotFound(id.to_string()))?;
            entry.session.outbound_tx.clone()
        };
        let _ = outbound_tx.send(OutboundCommand::Close(code, reason)).await;
        Ok(())
    }

    /// Spec §4.5/§8 invariant 10: the tail of the buffer after `afterSeq`,
    /// followed by exactly one `replay.end`; a gap is reported but not
    /// stored, and replay never mutates `lastSeq` or the buffer.
    pub async fn replay(&self, id: &str, after_seq: Option<u64>) -> Result<Vec<WsEnvelope>, ApiError> {
        let after_seq = after_seq.unwrap_or(0);
        let inner = self.inner.read().await;
        let entry = inner.get(id).ok_or_else(|| ApiError::WsSessionNotFound(id.to_string()))?;
        let now = self.clock.now();

        let mut out = Vec::new();
        let oldest = entry.session.replay_buffer.front().map(|e| e.seq);
        let gap = oldest.map(|o| o > after_seq + 1).unwrap_or(false);

        if let Some(oldest_seq) = oldest {
            if gap {
                out.push(WsEnvelope {
                    kind: "session.error".to_string(),
                    ts: now,
                    ws_session_id: id.to_string(),
                    seq: entry.session.last_seq,
                    payload: json!({ "code": "WS_REPLAY_GAP", "afterSeq": after_seq, "oldestAvailableSeq": oldest_seq }),
                });
            }
        }

        let replayed: Vec<WsEnvelope> = entry.session.replay_buffer.iter().filter(|e| e.seq > after_seq).cloned().collect();
        let replayed_count = replayed.len();
        out.extend(replayed);

        out.push(WsEnvelope {
            kind: "session.replay.end".to_string(),
            ts: now,
            ws_session_id: id.to_string(),
            seq: entry.session.last_seq,
            payload: json!({ "afterSeq": after_seq, "replayed": replayed_count, "gap": gap }),
        });

        Ok(out)
    }

    pub async fn snapshot(&self, id: &str) -> Result<WsSessionSnapshot, ApiError> {
        let inner = self.inner.read().await;
        inner
            .get(id)
            .map(|entry| entry.session.snapshot())
            .ok_or_else(|| ApiError::WsSessionNotFound(id.to_string()))
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    /// Spec §4.5: sessions idle beyond `idleTimeoutMs` are closed with code
    /// 1001/"Idle timeout".
    pub async fn sweep_idle(&self) {
        let now = self.clock.now();
        let expired: Vec<mpsc::Sender<OutboundCommand>> = {
            let inner = self.inner.read().await;
            inner
                .values()
                .filter(|entry| {
                    let idle = chrono::Duration::milliseconds(entry.session.idle_timeout_ms as i64);
                    now - entry.session.last_activity_at > idle
                })
                .map(|entry| entry.session.outbound_tx.clone())
                .collect()
        };
        for tx in expired {
            let _ = tx.send(OutboundCommand::Close(Some(1001), Some("Idle timeout".to_string()))).await;
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

    /// Spec §4.5 `dispose`: closes all upstreams with 1001/"Server shutting down".
    pub async fn dispose(&self) {
        let senders: Vec<mpsc::Sender<OutboundCommand>> = {
            let inner = self.inner.read().await;
            inner.values().map(|entry| entry.session.outbound_tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.send(OutboundCommand::Close(Some(1001), Some("Server shutting down".to_string()))).await;
        }
    }
}

async fn best_effort_reject(upstream_url: String) {
    use futures::SinkExt;
    if let Ok((mut stream, _response)) = tokio_tungstenite::connect_async(&upstream_url).await {
        let frame = CloseFrame {
            code: 1013u16.into(),
            reason: "server overloaded".into(),
        };
        let _ = stream.close(Some(frame)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn manager() -> Arc<WsSessionManager> {
        WsSessionManager::new(Arc::new(SystemClock), 10)
    }

    #[tokio::test]
    async fn replay_on_unknown_session_fails() {
        let mgr = manager();
        let err = mgr.replay("missing", None).await.unwrap_err();
        assert!(matches!(err, ApiError::WsSessionNotFound(_)));
    }

    #[tokio::test]
    async fn replay_gap_and_tail_against_synthetic_buffer() {
        let mgr = manager();
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let (control_tx, _control_rx) = broadcast::channel(8);
        let id = "ws-1".to_string();
        let now = Utc::now();

        let mut buffer = VecDeque::new();
        buffer.push_back(WsEnvelope { kind: "session.opened".to_string(), ts: now, ws_session_id: id.clone(), seq: 1, payload: json!({}) });
        buffer.push_back(WsEnvelope { kind: "session.inbound".to_string(), ts: now, ws_session_id: id.clone(), seq: 3, payload: json!({}) });
        buffer.push_back(WsEnvelope { kind: "session.inbound".to_string(), ts: now, ws_session_id: id.clone(), seq: 4, payload: json!({}) });

        let session = WsSession {
            id: id.clone(),
            upstream_url: "wss://example.invalid".to_string(),
            flow_id: None,
            req_exec_id: None,
            subprotocol: None,
            created_at: now,
            last_activity_at: now,
            ready_state: ReadyState::Open,
            idle_timeout_ms: 300_000,
            replay_buffer_size: 2,
            max_frame_bytes: 262_144,
            last_seq: 4,
            replay_buffer: buffer,
            outbound_tx,
        };
        mgr.inner.write().await.insert(id.clone(), Entry { session, control_tx });

        let envelopes = mgr.replay(&id, Some(1)).await.unwrap();
        assert_eq!(envelopes[0].kind, "session.error");
        assert_eq!(envelopes[0].payload["code"], "WS_REPLAY_GAP");
        assert_eq!(envelopes[0].payload["oldestAvailableSeq"], 3);
        assert_eq!(envelopes[1].seq, 3);
        assert_eq!(envelopes[2].seq, 4);
        assert_eq!(envelopes[3].kind, "session.replay.end");
        assert_eq!(envelopes[3].payload["replayed"], 2);
        assert_eq!(envelopes[3].payload["gap"], true);
    }

    #[tokio::test]
    async fn replay_without_gap_omits_gap_envelope() {
        let mgr = manager();
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let (control_tx, _control_rx) = broadcast::channel(8);
        let id = "ws-2".to_string();
        let now = Utc::now();

        let mut buffer = VecDeque::new();
        buffer.push_back(WsEnvelope { kind: "session.inbound".to_string(), ts: now, ws_session_id: id.clone(), seq: 1, payload: json!({}) });
        buffer.push_back(WsEnvelope { kind: "session.inbound".to_string(), ts: now, ws_session_id: id.clone(), seq: 2, payload: json!({}) });

        let session = WsSession {
            id: id.clone(),
            upstream_url: "wss://example.invalid".to_string(),
            flow_id: None,
            req_exec_id: None,
            subprotocol: None,
            created_at: now,
            last_activity_at: now,
            ready_state: ReadyState::Open,
            idle_timeout_ms: 300_000,
            replay_buffer_size: 10,
            max_frame_bytes: 262_144,
            last_seq: 2,
            replay_buffer: buffer,
            outbound_tx,
        };
        mgr.inner.write().await.insert(id.clone(), Entry { session, control_tx });

        let envelopes = mgr.replay(&id, Some(0)).await.unwrap();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[2].kind, "session.replay.end");
        assert_eq!(envelopes[2].payload["gap"], false);
    }
}
