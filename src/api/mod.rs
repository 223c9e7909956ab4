//! Control-plane HTTP/SSE/WebSocket surface (spec §6): wires every
//! component behind `AppState` into one `axum::Router`.

pub mod config_handler;
pub mod event_handlers;
pub mod execute;
pub mod flow_handlers;
pub mod health;
pub mod middleware;
pub mod parse;
pub mod plugins_handlers;
pub mod routes;
pub mod scripts_handlers;
pub mod session_handlers;
pub mod workspace;
pub mod ws_handlers;

use std::sync::Arc;

use crate::config::{Config, ConfigResolver};
use crate::content_loader::ContentLoader;
use crate::engine::ExecutionEngine;
use crate::events::EventBus;
use crate::flow::FlowManager;
use crate::parser::RequestParser;
use crate::plugin::PluginHost;
use crate::scripts::ScriptRunner;
use crate::session::SessionManager;
use crate::ws::WsSessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<ExecutionEngine>,
    pub sessions: Arc<SessionManager>,
    pub flows: Arc<FlowManager>,
    pub events: Arc<EventBus>,
    pub ws_sessions: Arc<WsSessionManager>,
    pub scripts: Arc<ScriptRunner>,
    pub plugins: Arc<PluginHost>,
    pub content_loader: Arc<ContentLoader>,
    pub parser: Arc<dyn RequestParser>,
    pub config_resolver: Arc<dyn ConfigResolver>,
    pub http: reqwest::Client,
}

pub use routes::create_app;
