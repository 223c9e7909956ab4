mod api;
mod clock;
mod config;
mod content_loader;
mod cookie;
mod engine;
mod error;
mod events;
mod flow;
mod ids;
mod interpolate;
mod model;
mod parser;
mod plugin;
mod redact;
mod scripts;
mod session;
mod sse_exec;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use api::AppState;
use clock::SystemClock;
use config::{Config, FileConfigResolver};
use content_loader::ContentLoader;
use cookie::JarLockRegistry;
use engine::ExecutionEngine;
use events::EventBus;
use flow::FlowManager;
use interpolate::ResolverRegistry;
use parser::HttpSyntaxParser;
use plugin::PluginHost;
use scripts::ScriptRunner;
use session::SessionManager;
use ws::WsSessionManager;

#[derive(Parser, Debug)]
#[command(name = "reqrunner", about = "Local HTTP request runner and control plane")]
enum Cli {
    /// Start the control-plane server (default when no subcommand is given).
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = if std::env::args().count() <= 1 {
        Cli::Serve {
            bind: None,
            token: None,
            workspace: None,
        }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { bind, token, workspace } => run_server(bind, token, workspace).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reqrunner=info,tower_http=warn"));
    let ansi = std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
        .init();
}

async fn run_server(bind: Option<String>, token: Option<String>, workspace: Option<String>) -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_raw_values(bind.as_deref(), token.as_deref(), workspace.as_deref());
    let config = Arc::new(merge_env_defaults(config));

    tokio::fs::create_dir_all(&config.workspace_root).await.ok();

    let clock: Arc<dyn clock::Clock> = Arc::new(SystemClock);

    let sessions = SessionManager::new(clock.clone(), config.max_sessions, config.session_ttl_secs);
    let flows = FlowManager::new(
        clock.clone(),
        sessions.clone(),
        config.max_flows,
        config.max_executions_per_flow,
        config.flow_idle_secs,
    );
    let events = EventBus::new(clock.clone());
    let content_loader = Arc::new(ContentLoader::new(config.workspace_root.clone()));
    let plugins = Arc::new(PluginHost::new(Vec::new()));
    let resolvers = Arc::new(ResolverRegistry::new());
    let jar_locks = Arc::new(JarLockRegistry::new());
    let parser: Arc<dyn parser::RequestParser> = Arc::new(HttpSyntaxParser::new());
    let config_resolver: Arc<dyn config::ConfigResolver> = Arc::new(FileConfigResolver::new((*config).clone()));

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_millis(config.default_timeout_ms.max(30_000)))
        .build()?;

    let engine = Arc::new(ExecutionEngine::new(
        parser.clone(),
        config_resolver.clone(),
        content_loader.clone(),
        sessions.clone(),
        flows.clone(),
        events.clone(),
        plugins.clone(),
        resolvers.clone(),
        jar_locks.clone(),
        http.clone(),
        clock.clone(),
    ));

    let ws_sessions = WsSessionManager::new(clock.clone(), config.max_ws_sessions);
    let scripts = ScriptRunner::new(
        flows.clone(),
        events.clone(),
        clock.clone(),
        config.max_concurrent_scripts,
        config.script_timeout_ms,
        config.script_max_output_bytes,
        config.script_token_ttl_secs,
        config.script_env_allowlist.clone(),
    );

    sessions.spawn_sweeper();
    flows.spawn_sweeper();
    ws_sessions.spawn_sweeper();

    let state = AppState {
        config: config.clone(),
        engine,
        sessions,
        flows,
        events,
        ws_sessions,
        scripts,
        plugins,
        content_loader,
        parser,
        config_resolver,
        http,
    };

    let app = api::create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "reqrunner listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Layers `REQRUNNER_*` env vars on top of CLI-supplied values, so a flag
/// always wins but an unset flag still falls back to the environment.
fn merge_env_defaults(mut config: Config) -> Config {
    if std::env::var("REQRUNNER_BIND").is_ok() && config.bind == "127.0.0.1:4500" {
        config.bind = std::env::var("REQRUNNER_BIND").unwrap();
    }
    if config.bearer_token.is_none() {
        config.bearer_token = std::env::var("REQRUNNER_TOKEN").ok().filter(|s| !s.is_empty());
    }
    if std::env::var("REQRUNNER_WORKSPACE").is_ok() && config.workspace_root == config::default_workspace_root() {
        config.workspace_root = std::env::var("REQRUNNER_WORKSPACE").unwrap().into();
    }
    config
}
