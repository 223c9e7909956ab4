//! Process configuration (bind address, bearer token, workspace root,
//! capacity limits) plus the external `ConfigResolver` collaborator (spec's
//! "project-configuration loader", out of scope in depth but needed end to
//! end to drive `execute`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::model::{CookieMode, ResolvedConfig};

/// Server-wide configuration loaded from environment variables and CLI
/// flags, mirroring the teacher's `Config::from_env` / `from_raw_values`
/// split so tests never need to mutate the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub bearer_token: Option<String>,
    pub workspace_root: PathBuf,
    pub max_sessions: usize,
    pub session_ttl_secs: u64,
    pub max_flows: usize,
    pub max_executions_per_flow: usize,
    pub flow_idle_secs: u64,
    pub max_ws_sessions: usize,
    pub ws_idle_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub default_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub hook_timeout_ms: u64,
    pub default_max_retries: u32,
    pub max_concurrent_scripts: usize,
    pub script_timeout_ms: u64,
    pub script_max_output_bytes: usize,
    pub script_token_ttl_secs: u64,
    pub script_env_allowlist: Vec<String>,
}

const HARD_TIMEOUT_CAP_MS: u64 = 300_000;

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("REQRUNNER_BIND").ok().as_deref(),
            std::env::var("REQRUNNER_TOKEN").ok().as_deref(),
            std::env::var("REQRUNNER_WORKSPACE").ok().as_deref(),
        )
    }

    /// Built from raw string values, exactly the values that would come from
    /// env vars or CLI flags, so tests can construct one without touching
    /// process-global environment.
    pub fn from_raw_values(bind: Option<&str>, bearer_token: Option<&str>, workspace: Option<&str>) -> Self {
        let bind = bind.filter(|s| !s.is_empty()).map(String::from).unwrap_or_else(|| "127.0.0.1:4500".to_string());
        let bearer_token = bearer_token.filter(|s| !s.is_empty()).map(String::from);
        let workspace_root = workspace
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_workspace_root);

        Config {
            bind,
            bearer_token,
            workspace_root,
            max_sessions: 1000,
            session_ttl_secs: 30 * 60,
            max_flows: 100,
            max_executions_per_flow: 500,
            flow_idle_secs: 5 * 60,
            max_ws_sessions: 100,
            ws_idle_timeout_ms: 5 * 60 * 1000,
            max_frame_bytes: 262_144,
            default_timeout_ms: 30_000,
            max_body_bytes: 10 * 1024 * 1024,
            hook_timeout_ms: 30_000,
            default_max_retries: 3,
            max_concurrent_scripts: 16,
            script_timeout_ms: 15 * 60 * 1000,
            script_max_output_bytes: 1024 * 1024,
            script_token_ttl_secs: 15 * 60,
            script_env_allowlist: vec!["PATH".to_string(), "HOME".to_string()],
        }
    }

    /// Is this server bound to loopback only? Spec: bearer token is required
    /// for non-loopback binds, optional for loopback.
    pub fn is_loopback_bind(&self) -> bool {
        self.bind.starts_with("127.0.0.1") || self.bind.starts_with("localhost") || self.bind.starts_with("[::1]")
    }

    pub fn auth_required(&self) -> bool {
        self.bearer_token.is_some() && !self.is_loopback_bind() || self.bearer_token.is_some()
    }
}

pub fn default_workspace_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".reqrunner").join("workspace"))
        .unwrap_or_else(|| PathBuf::from(".reqrunner-workspace"))
}

/// On-disk project configuration overlay (`.runner.toml`), spec's external
/// "project-configuration loader" represented concretely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub cookie_jar_path: Option<PathBuf>,
}

#[async_trait::async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(
        &self,
        profile: Option<&str>,
        session_variables: Option<&BTreeMap<String, String>>,
        request_variables: Option<&BTreeMap<String, String>>,
    ) -> anyhow::Result<ResolvedConfig>;
}

/// Minimal concrete `ConfigResolver`: reads `<workspace_root>/.runner.toml`
/// if present, applies the named profile overlay, then layers session and
/// per-request variables on top (spec §4.3 step 6, later wins).
pub struct FileConfigResolver {
    base: Config,
}

impl FileConfigResolver {
    pub fn new(base: Config) -> Self {
        Self { base }
    }

    fn project_file_path(&self) -> PathBuf {
        self.base.workspace_root.join(".runner.toml")
    }

    async fn load_project_file(&self) -> anyhow::Result<ProjectFile> {
        let path = self.project_file_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProjectFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ConfigResolver for FileConfigResolver {
    async fn resolve(
        &self,
        profile: Option<&str>,
        session_variables: Option<&BTreeMap<String, String>>,
        request_variables: Option<&BTreeMap<String, String>>,
    ) -> anyhow::Result<ResolvedConfig> {
        let project = self.load_project_file().await?;

        let mut variables = project.variables.clone();
        if let Some(profile_name) = profile {
            if let Some(overlay) = project.profiles.get(profile_name) {
                variables.extend(overlay.clone());
            }
        }
        if let Some(session_vars) = session_variables {
            variables.extend(session_vars.clone());
        }
        if let Some(request_vars) = request_variables {
            variables.extend(request_vars.clone());
        }

        let cookies = match project.cookies.as_deref() {
            Some("disabled") => CookieMode::Disabled,
            Some("persistent") => CookieMode::Persistent,
            _ => CookieMode::Memory,
        };

        let timeout_ms = project
            .timeout_ms
            .unwrap_or(self.base.default_timeout_ms)
            .min(HARD_TIMEOUT_CAP_MS);

        Ok(ResolvedConfig {
            profile: profile.unwrap_or("default").to_string(),
            variables,
            timeout_ms,
            max_body_bytes: project.max_body_bytes.unwrap_or(self.base.max_body_bytes),
            cookies,
            cookie_jar_path: project.cookie_jar_path.clone(),
            workspace_root: self.base.workspace_root.clone(),
        })
    }
}

pub fn clamp_timeout(requested: Option<u64>, default_ms: u64) -> u64 {
    requested.unwrap_or(default_ms).min(HARD_TIMEOUT_CAP_MS)
}

pub fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_bind_uses_default() {
        let config = Config::from_raw_values(Some(""), None, None);
        assert_eq!(config.bind, "127.0.0.1:4500");
    }

    #[test]
    fn test_config_custom_bind() {
        let config = Config::from_raw_values(Some("0.0.0.0:9000"), None, None);
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert!(!config.is_loopback_bind());
    }

    #[test]
    fn test_config_empty_token_is_none() {
        let config = Config::from_raw_values(None, Some(""), None);
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn test_clamp_timeout_respects_hard_cap() {
        assert_eq!(clamp_timeout(Some(999_999_999), 30_000), HARD_TIMEOUT_CAP_MS);
    }

    #[test]
    fn test_clamp_timeout_default() {
        assert_eq!(clamp_timeout(None, 30_000), 30_000);
    }
}
