//! Session Manager (spec §4.1): named conversational contexts holding
//! variables, a cookie jar, and a per-session mutex.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::cookie::CookieJar;
use crate::error::ApiError;
use crate::ids::new_id;
use crate::redact::redact_variables;

pub struct Session {
    pub id: String,
    pub variables: BTreeMap<String, String>,
    pub cookie_jar: CookieJar,
    pub cookie_jar_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub snapshot_version: u64,
    /// Per-session mutex (spec §5.2): variable and cookie mutations, and any
    /// execution declaring this session, are serialized through it.
    pub lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub variables: BTreeMap<String, String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastUsedAt")]
    pub last_used_at: DateTime<Utc>,
    #[serde(rename = "snapshotVersion")]
    pub snapshot_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Merge,
    Replace,
}

struct Inner {
    sessions: HashMap<String, Session>,
    /// Insertion/access order, oldest first, for LRU eviction.
    lru: Vec<String>,
}

pub struct SessionManager {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
    max_sessions: usize,
    ttl_secs: u64,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, max_sessions: usize, ttl_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                lru: Vec::new(),
            }),
            clock,
            max_sessions,
            ttl_secs,
        })
    }

    fn touch_lru(lru: &mut Vec<String>, id: &str) {
        lru.retain(|existing| existing != id);
        lru.push(id.to_string());
    }

    /// Spec §4.1: evicts the LRU session when `maxSessions` is reached,
    /// silently — the evicted id becomes invalid but no error is raised.
    pub async fn create(&self, initial_variables: Option<BTreeMap<String, String>>) -> String {
        let mut inner = self.inner.write().await;
        if inner.sessions.len() >= self.max_sessions {
            if let Some(evict_id) = inner.lru.first().cloned() {
                inner.sessions.remove(&evict_id);
                inner.lru.remove(0);
            }
        }

        let now = self.clock.now();
        let id = new_id();
        let session = Session {
            id: id.clone(),
            variables: initial_variables.unwrap_or_default(),
            cookie_jar: CookieJar::default(),
            cookie_jar_path: None,
            created_at: now,
            last_used_at: now,
            snapshot_version: 0,
            lock: Arc::new(Mutex::new(())),
        };
        inner.sessions.insert(id.clone(), session);
        Self::touch_lru(&mut inner.lru, &id);
        id
    }

    pub async fn get(&self, id: &str) -> Result<SessionSnapshot, ApiError> {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();
        Self::touch_lru(&mut inner.lru, id);
        let session = inner.sessions.get_mut(id).ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
        session.last_used_at = now;
        Ok(SessionSnapshot {
            id: session.id.clone(),
            variables: redact_variables(&session.variables),
            created_at: session.created_at,
            last_used_at: session.last_used_at,
            snapshot_version: session.snapshot_version,
        })
    }

    /// Spec §4.1: `merge` does a shallow overlay, `replace` replaces the
    /// variables map entirely, under the session mutex, never partially
    /// applied.
    pub async fn update(
        &self,
        id: &str,
        variables: BTreeMap<String, String>,
        mode: UpdateMode,
    ) -> Result<(String, u64), ApiError> {
        let lock = {
            let inner = self.inner.read().await;
            let session = inner.sessions.get(id).ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
            session.lock.clone()
        };
        let _guard = lock.lock().await;

        let mut inner = self.inner.write().await;
        let now = self.clock.now();
        let session = inner.sessions.get_mut(id).ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;

        match mode {
            UpdateMode::Merge => session.variables.extend(variables),
            UpdateMode::Replace => session.variables = variables,
        }
        session.snapshot_version += 1;
        session.last_used_at = now;
        Self::touch_lru(&mut inner.lru, id);
        Ok((id.to_string(), inner.sessions[id].snapshot_version))
    }

    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.remove(id).is_none() {
            return Err(ApiError::SessionNotFound(id.to_string()));
        }
        inner.lru.retain(|existing| existing != id);
        Ok(())
    }

    /// Internal accessor used by the execution engine to mutate cookies
    /// under the session's own mutex (spec §4.3 step 9 "in a session").
    pub async fn with_session_lock<F, R>(&self, id: &str, f: F) -> Result<R, ApiError>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let lock = {
            let inner = self.inner.read().await;
            let session = inner.sessions.get(id).ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
            session.lock.clone()
        };
        let _guard = lock.lock().await;

        let mut inner = self.inner.write().await;
        let now = self.clock.now();
        let session = inner.sessions.get_mut(id).ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
        let result = f(session);
        session.last_used_at = now;
        Ok(result)
    }

    /// Bumps `snapshotVersion` for a cookie mutation applied outside of
    /// `update` (spec §4.3 step 11: cookie changes also count as mutations).
    pub async fn bump_snapshot_version(&self, id: &str) -> Result<u64, ApiError> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(id).ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
        session.snapshot_version += 1;
        Ok(session.snapshot_version)
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(id)
    }

    /// Background sweep (spec §4.1: default TTL 30 min, swept every 60 s).
    pub async fn sweep_idle(&self) {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();
        let ttl = chrono::Duration::seconds(self.ttl_secs as i64);
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| now - s.last_used_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.sessions.remove(id);
            inner.lru.retain(|existing| existing != id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept idle sessions");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, TestClock};

    fn manager(max: usize, ttl: u64) -> Arc<SessionManager> {
        SessionManager::new(Arc::new(SystemClock), max, ttl)
    }

    #[tokio::test]
    async fn create_and_get_round_trip_variables() {
        let mgr = manager(10, 1800);
        let mut vars = BTreeMap::new();
        vars.insert("host".to_string(), "example.com".to_string());
        let id = mgr.create(Some(vars.clone())).await;
        let snapshot = mgr.get(&id).await.unwrap();
        assert_eq!(snapshot.variables, vars);
    }

    #[tokio::test]
    async fn sensitive_variables_are_redacted_on_get() {
        let mgr = manager(10, 1800);
        let mut vars = BTreeMap::new();
        vars.insert("api_key".to_string(), "sk-123".to_string());
        let id = mgr.create(Some(vars)).await;
        let snapshot = mgr.get(&id).await.unwrap();
        assert_eq!(snapshot.variables["api_key"], "[REDACTED]");
    }

    #[tokio::test]
    async fn update_merge_then_replace_equals_replace() {
        let mgr = manager(10, 1800);
        let id = mgr.create(None).await;

        let mut delta = BTreeMap::new();
        delta.insert("a".to_string(), "1".to_string());
        mgr.update(&id, delta, UpdateMode::Merge).await.unwrap();

        let mut replacement = BTreeMap::new();
        replacement.insert("b".to_string(), "2".to_string());
        mgr.update(&id, replacement.clone(), UpdateMode::Replace).await.unwrap();

        let snapshot = mgr.get(&id).await.unwrap();
        assert_eq!(snapshot.variables, replacement);
    }

    #[tokio::test]
    async fn snapshot_version_strictly_increases() {
        let mgr = manager(10, 1800);
        let id = mgr.create(None).await;
        let (_, v1) = mgr.update(&id, BTreeMap::new(), UpdateMode::Merge).await.unwrap();
        let (_, v2) = mgr.update(&id, BTreeMap::new(), UpdateMode::Merge).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn delete_twice_yields_not_found_on_second_call() {
        let mgr = manager(10, 1800);
        let id = mgr.create(None).await;
        mgr.delete(&id).await.unwrap();
        let err = mgr.delete(&id).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn full_table_evicts_lru_not_the_new_id() {
        let mgr = manager(2, 1800);
        let first = mgr.create(None).await;
        let _second = mgr.create(None).await;
        let third = mgr.create(None).await;

        assert!(!mgr.exists(&first).await);
        assert!(mgr.exists(&third).await);
        let count = {
            let inner = mgr.inner.read().await;
            inner.sessions.len()
        };
        assert!(count <= 2);
    }

    #[tokio::test]
    async fn idle_sweep_evicts_sessions_past_ttl() {
        let clock = TestClock::new(Utc::now());
        let mgr = Arc::new(SessionManager {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                lru: Vec::new(),
            }),
            clock: clock.clone(),
            max_sessions: 10,
            ttl_secs: 1800,
        });
        let id = mgr.create(None).await;
        clock.advance(chrono::Duration::seconds(1801));
        mgr.sweep_idle().await;
        assert!(!mgr.exists(&id).await);
    }
}
