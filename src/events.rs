//! Event Bus (spec §4.6): subscriber registry fanning envelopes to SSE/WS
//! clients filtered by session/flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, RwLock};

use crate::clock::Clock;
use crate::ids::new_id;
use crate::model::EventEnvelope;

struct Subscriber {
    session_filter: Option<String>,
    flow_filter: Option<String>,
    sink: mpsc::Sender<EventEnvelope>,
}

struct RunCounter {
    seq: AtomicU64,
    last_used_at: std::sync::Mutex<DateTime<Utc>>,
}

/// Fans envelopes out to subscribers matched by session/flow filters
/// (undefined filter = wildcard). Assigns a run-scoped `seq` only when the
/// producer didn't already stamp a flow-scoped one.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    run_counters: RwLock<HashMap<String, Arc<RunCounter>>>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            run_counters: RwLock::new(HashMap::new()),
            clock,
        })
    }

    pub async fn subscribe(
        &self,
        session_filter: Option<String>,
        flow_filter: Option<String>,
    ) -> (String, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(256);
        let id = new_id();
        self.subscribers.write().await.insert(
            id.clone(),
            Subscriber {
                session_filter,
                flow_filter,
                sink: tx,
            },
        );
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: &str) {
        self.subscribers.write().await.remove(id);
    }

    /// Emits a pre-built envelope (already flow-scoped, e.g. from
    /// `FlowManager::emit_event`) to matching subscribers. Delivery is
    /// best-effort: a closed/full sink is treated as a throwing sink and
    /// silently unsubscribed.
    pub async fn emit_envelope(&self, envelope: EventEnvelope) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if !matches_filter(&sub.session_filter, &envelope.session_id) {
                    continue;
                }
                if !matches_filter(&sub.flow_filter, &envelope.flow_id) {
                    continue;
                }
                if sub.sink.try_send(envelope.clone()).is_err() {
                    dead.push(id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    /// Run-scoped emission for executions with no flow attached: assigns a
    /// counter keyed by `runId` the bus owns (spec §4.6).
    pub async fn emit_run_scoped(
        &self,
        session_id: Option<String>,
        run_id: &str,
        kind: &str,
        payload: serde_json::Value,
    ) {
        let counter = self.counter_for(run_id).await;
        let seq = counter.seq.fetch_add(1, Ordering::SeqCst) + 1;
        *counter.last_used_at.lock().unwrap() = self.clock.now();

        let mut envelope = EventEnvelope::new(kind, self.clock.now(), run_id, seq, payload);
        envelope.session_id = session_id;
        self.emit_envelope(envelope).await;

        self.maybe_sweep_counters().await;
    }

    async fn counter_for(&self, run_id: &str) -> Arc<RunCounter> {
        if let Some(existing) = self.run_counters.read().await.get(run_id) {
            return existing.clone();
        }
        let mut counters = self.run_counters.write().await;
        counters
            .entry(run_id.to_string())
            .or_insert_with(|| {
                Arc::new(RunCounter {
                    seq: AtomicU64::new(0),
                    last_used_at: std::sync::Mutex::new(Utc::now()),
                })
            })
            .clone()
    }

    /// Spec §4.6: probabilistic sweep (1% of emits once the map exceeds 100
    /// entries), dropping entries idle > 5 min.
    async fn maybe_sweep_counters(&self) {
        let should_sweep = {
            let counters = self.run_counters.read().await;
            counters.len() > 100 && rand::rng().random_bool(0.01)
        };
        if !should_sweep {
            return;
        }
        let now = self.clock.now();
        let mut counters = self.run_counters.write().await;
        counters.retain(|_, counter| {
            let last_used = *counter.last_used_at.lock().unwrap();
            now - last_used <= chrono::Duration::minutes(5)
        });
    }

    pub async fn close_all(&self) {
        self.subscribers.write().await.clear();
    }
}

fn matches_filter(filter: &Option<String>, value: &Option<String>) -> bool {
    match filter {
        None => true,
        Some(want) => value.as_deref() == Some(want.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[tokio::test]
    async fn subscriber_receives_matching_flow_events() {
        let bus = EventBus::new(Arc::new(SystemClock));
        let (_id, mut rx) = bus.subscribe(None, Some("flow-1".to_string())).await;

        let mut envelope = EventEnvelope::new("requestQueued", Utc::now(), "run-1", 1, serde_json::json!({}));
        envelope.flow_id = Some("flow-1".to_string());
        bus.emit_envelope(envelope).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.flow_id.as_deref(), Some("flow-1"));
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_nonmatching_flow_events() {
        let bus = EventBus::new(Arc::new(SystemClock));
        let (_id, mut rx) = bus.subscribe(None, Some("flow-1".to_string())).await;

        let mut envelope = EventEnvelope::new("requestQueued", Utc::now(), "run-1", 1, serde_json::json!({}));
        envelope.flow_id = Some("flow-2".to_string());
        bus.emit_envelope(envelope).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_scoped_emission_increments_seq() {
        let bus = EventBus::new(Arc::new(SystemClock));
        let (_id, mut rx) = bus.subscribe(None, None).await;
        bus.emit_run_scoped(None, "run-1", "fetchStarted", serde_json::json!({})).await;
        bus.emit_run_scoped(None, "run-1", "fetchFinished", serde_json::json!({})).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(Arc::new(SystemClock));
        let (id, mut rx) = bus.subscribe(None, None).await;
        bus.unsubscribe(&id).await;

        bus.emit_run_scoped(None, "run-1", "fetchStarted", serde_json::json!({})).await;
        assert!(rx.try_recv().is_err());
    }
}
