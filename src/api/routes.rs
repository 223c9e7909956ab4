use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{middleware, AppState};
use super::{
    config_handler, event_handlers, execute, flow_handlers, health, parse, plugins_handlers, scripts_handlers,
    session_handlers, workspace, ws_handlers,
};

pub fn create_app(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health::health));

    let protected = Router::new()
        .route("/capabilities", get(health::capabilities))
        .route("/config", get(config_handler::get_config))
        .route("/parse", post(parse::parse))
        .route("/execute", post(execute::execute))
        .route("/execute/sse", post(execute::execute_sse))
        .route("/session", post(session_handlers::create_session))
        .route(
            "/session/{id}",
            get(session_handlers::get_session).delete(session_handlers::delete_session),
        )
        .route("/session/{id}/variables", put(session_handlers::update_session_variables))
        .route("/flows", post(flow_handlers::create_flow))
        .route("/flows/{flowId}", get(flow_handlers::get_flow))
        .route("/flows/{flowId}/finish", post(flow_handlers::finish_flow))
        .route("/flows/{flowId}/executions/{reqExecId}", get(flow_handlers::get_flow_execution))
        .route("/event", get(event_handlers::subscribe_events))
        .route("/ws/session/{id}", get(ws_handlers::open_ws_session))
        .route(
            "/workspace/file",
            get(workspace::get_file)
                .put(workspace::put_file)
                .post(workspace::create_file)
                .delete(workspace::delete_file),
        )
        .route("/workspace/files", get(workspace::list_files))
        .route("/workspace/requests", get(workspace::list_requests))
        .route("/script", post(scripts_handlers::run_script))
        .route("/script/{runId}", delete(scripts_handlers::cancel_run))
        .route("/script/runners", get(scripts_handlers::script_runners))
        .route("/test", post(scripts_handlers::run_test))
        .route("/test/{runId}", delete(scripts_handlers::cancel_run))
        .route("/test/frameworks", get(scripts_handlers::test_frameworks))
        .route("/plugins", get(plugins_handlers::list_plugins))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_bearer_auth));

    public
        .merge(protected)
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(middleware::enrich_current_span_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn not_found(req: axum::extract::Request) -> impl axum::response::IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (axum::http::StatusCode::NOT_FOUND, "Not Found")
}
