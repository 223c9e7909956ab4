//! Cookie Store (spec §2, §4.3 step 9, §9 design note "weak per-path lock").
//!
//! A jar is a flat multimap of cookie name → value, serialized as JSON on
//! disk when the jar is persistent. Concurrent access to one jar path is
//! serialized by a lazily-created, never-removed mutex keyed by the
//! absolute path — the keyed-mutex-registry idiom the teacher uses for its
//! per-pid process pools.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieJar {
    #[serde(default)]
    pub cookies: HashMap<String, String>,
}

impl CookieJar {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    /// Renders the jar as a `Cookie:` request header value.
    pub fn to_header_value(&self) -> String {
        self.cookies.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("; ")
    }

    /// Applies upstream `Set-Cookie` header values (one per occurrence, spec
    /// §4.3 step 10: multi-value Set-Cookie preserved as multiple entries).
    /// Returns true if any cookie's value actually changed.
    pub fn apply_set_cookie_headers(&mut self, values: &[String]) -> bool {
        let mut changed = false;
        for raw in values {
            if let Some((name, value)) = parse_set_cookie(raw) {
                if self.cookies.get(&name) != Some(&value) {
                    changed = true;
                }
                self.cookies.insert(name, value);
            }
        }
        changed
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let first_segment = raw.split(';').next()?;
    let (name, value) = first_segment.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// Process-wide registry of per-jar-path mutexes. Entries are created lazily
/// under a short-lived write lock on the registry, then the caller acquires
/// the returned mutex itself — mirrors the teacher's pool-of-locks pattern
/// for per-key resources in `api/mod.rs`'s `AppState`.
#[derive(Clone, Default)]
pub struct JarLockRegistry {
    locks: Arc<RwLock<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl JarLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.read().await.get(path) {
            return existing.clone();
        }
        let mut write = self.locks.write().await;
        write.entry(path.to_path_buf()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_cookie_value_and_attributes() {
        let (name, value) = parse_set_cookie("a=1; Path=/; HttpOnly").unwrap();
        assert_eq!(name, "a");
        assert_eq!(value, "1");
    }

    #[test]
    fn header_value_joins_all_cookies() {
        let mut jar = CookieJar::default();
        jar.set("a", "1");
        let header = jar.to_header_value();
        assert_eq!(header, "a=1");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jar.json");
        let mut jar = CookieJar::default();
        jar.set("session", "abc");
        jar.save(&path).await.unwrap();

        let loaded = CookieJar::load(&path).await.unwrap();
        assert_eq!(loaded.cookies.get("session"), Some(&"abc".to_string()));
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded = CookieJar::load(&path).await.unwrap();
        assert!(loaded.cookies.is_empty());
    }

    #[tokio::test]
    async fn registry_returns_same_mutex_for_same_path() {
        let registry = JarLockRegistry::new();
        let path = PathBuf::from("/tmp/a/jar.json");
        let a = registry.lock_for(&path).await;
        let b = registry.lock_for(&path).await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
