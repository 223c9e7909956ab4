//! Plugin Hook Dispatch (spec §4.7).
//!
//! Plugin hosting internals are out of scope (spec §1); this module builds
//! the dispatcher itself — ordered per-stage hook invocation with timeout,
//! modification detection, and retry/skip signals — against a typed
//! capability set per REDESIGN FLAGS (§9 "hook dispatch over plugin instances").

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::model::{PluginHookRecord, PluginReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    ParseAfter,
    Validate,
    RequestBefore,
    RequestCompiled,
    RequestAfter,
    ResponseAfter,
    Error,
}

impl HookStage {
    pub fn as_str(self) -> &'static str {
        match self {
            HookStage::ParseAfter => "parse.after",
            HookStage::Validate => "validate",
            HookStage::RequestBefore => "request.before",
            HookStage::RequestCompiled => "request.compiled",
            HookStage::RequestAfter => "request.after",
            HookStage::ResponseAfter => "response.after",
            HookStage::Error => "error",
        }
    }
}

#[derive(Debug, Default)]
pub struct PluginCapabilities {
    pub hooks: HashSet<HookStage>,
    pub resolvers: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrySignal {
    pub delay_ms: u64,
    pub reason: String,
}

/// Result of one hook invocation (spec §4.7): may mutate `output`, may
/// request `skip` (request.before) or `retry` (response.after / error), and
/// may call `ctx.report(data)` producing zero or more reports.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub output: Option<Value>,
    pub skip: bool,
    pub retry: Option<RetrySignal>,
    pub reports: Vec<Value>,
}

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> &PluginCapabilities;

    /// Runs the hook for `stage` if the plugin declares it; implementations
    /// not declaring the stage should never be invoked (the dispatcher
    /// checks `capabilities()` first).
    async fn run_hook(&self, stage: HookStage, input: &Value, output: Option<&Value>) -> anyhow::Result<HookOutcome>;
}

pub const HOOK_TIMEOUT_MS: u64 = 30_000;

pub struct HookDispatchResult {
    pub output: Option<Value>,
    pub skip: bool,
    pub retry: Option<RetrySignal>,
    pub hooks: Vec<PluginHookRecord>,
    pub reports: Vec<PluginReport>,
}

pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
    hook_timeout: Duration,
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins,
            hook_timeout: Duration::from_millis(HOOK_TIMEOUT_MS),
        }
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Runs every plugin registered for `stage`, in registration order.
    /// A hook that exceeds the hard timeout is recorded as failed and the
    /// dispatcher proceeds to the next hook — degradation, not abort.
    pub async fn dispatch(
        &self,
        stage: HookStage,
        input: &Value,
        mut output: Option<Value>,
        run_id: &str,
        flow_id: Option<&str>,
        req_exec_id: Option<&str>,
        request_name: Option<&str>,
        report_seq: &mut u64,
    ) -> HookDispatchResult {
        let mut hooks = Vec::new();
        let mut reports = Vec::new();
        let mut skip = false;
        let mut retry = None;

        for plugin in self.plugins.iter().filter(|p| p.capabilities().hooks.contains(&stage)) {
            let started = std::time::Instant::now();
            let before_snapshot = output.clone();

            let invocation = tokio::time::timeout(
                self.hook_timeout,
                plugin.run_hook(stage, input, output.as_ref()),
            )
            .await;

            let duration_ms = started.elapsed().as_millis() as i64;

            match invocation {
                Ok(Ok(outcome)) => {
                    let modified = outcome.output != before_snapshot;
                    if let Some(new_output) = outcome.output.clone() {
                        output = Some(new_output);
                    }
                    if outcome.skip {
                        skip = true;
                    }
                    if outcome.retry.is_some() {
                        retry = outcome.retry.clone();
                    }
                    for data in outcome.reports {
                        *report_seq += 1;
                        reports.push(PluginReport {
                            plugin_name: plugin.name().to_string(),
                            run_id: run_id.to_string(),
                            flow_id: flow_id.map(str::to_string),
                            req_exec_id: req_exec_id.map(str::to_string),
                            request_name: request_name.map(str::to_string),
                            ts: Utc::now(),
                            seq: *report_seq,
                            data,
                        });
                    }
                    hooks.push(PluginHookRecord {
                        stage: stage.as_str().to_string(),
                        plugin_name: plugin.name().to_string(),
                        modified,
                        failed: false,
                        duration_ms,
                    });
                }
                Ok(Err(err)) => {
                    tracing::warn!(plugin = plugin.name(), stage = stage.as_str(), error = %err, "hook failed");
                    hooks.push(PluginHookRecord {
                        stage: stage.as_str().to_string(),
                        plugin_name: plugin.name().to_string(),
                        modified: false,
                        failed: true,
                        duration_ms,
                    });
                }
                Err(_timeout) => {
                    tracing::warn!(plugin = plugin.name(), stage = stage.as_str(), "hook timed out");
                    hooks.push(PluginHookRecord {
                        stage: stage.as_str().to_string(),
                        plugin_name: plugin.name().to_string(),
                        modified: false,
                        failed: true,
                        duration_ms,
                    });
                }
            }
        }

        HookDispatchResult {
            output,
            skip,
            retry,
            hooks,
            reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        name: String,
        capabilities: PluginCapabilities,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> &PluginCapabilities {
            &self.capabilities
        }
        async fn run_hook(&self, _stage: HookStage, _input: &Value, output: Option<&Value>) -> anyhow::Result<HookOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HookOutcome {
                output: output.cloned(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn only_plugins_declaring_the_stage_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut caps = PluginCapabilities::default();
        caps.hooks.insert(HookStage::RequestBefore);
        let plugin = Arc::new(CountingPlugin {
            name: "p1".to_string(),
            capabilities: caps,
            calls: calls.clone(),
        });
        let host = PluginHost::new(vec![plugin]);
        let mut seq = 0;
        host.dispatch(HookStage::ResponseAfter, &Value::Null, None, "run1", None, None, None, &mut seq).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        host.dispatch(HookStage::RequestBefore, &Value::Null, None, "run1", None, None, None, &mut seq).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FailingPlugin;

    #[async_trait::async_trait]
    impl Plugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }
        fn capabilities(&self) -> &PluginCapabilities {
            static CAPS: std::sync::OnceLock<PluginCapabilities> = std::sync::OnceLock::new();
            CAPS.get_or_init(|| {
                let mut c = PluginCapabilities::default();
                c.hooks.insert(HookStage::RequestBefore);
                c
            })
        }
        async fn run_hook(&self, _stage: HookStage, _input: &Value, _output: Option<&Value>) -> anyhow::Result<HookOutcome> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn failing_hook_is_recorded_but_dispatch_continues() {
        let host = PluginHost::new(vec![Arc::new(FailingPlugin)]);
        let mut seq = 0;
        let result = host
            .dispatch(HookStage::RequestBefore, &Value::Null, None, "run1", None, None, None, &mut seq)
            .await;
        assert_eq!(result.hooks.len(), 1);
        assert!(result.hooks[0].failed);
    }
}
