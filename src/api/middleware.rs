//! Request middleware: span enrichment and trailing-slash normalization are
//! carried over from the teacher almost verbatim
//! (`cthulu-backend`'s `server/middleware.rs`); bearer-token auth is new,
//! generalizing the teacher's single-token check into one that also accepts
//! a script/test scoped token (spec §6 "plus a short-lived scoped token for
//! spawned scripts/tests").

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::Span;

use super::AppState;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();
    let span = Span::current();
    span.record("http.uri", uri.path());
    if let Some(query) = uri.query() {
        span.record("http.query", query);
    }
    next.run(req).await
}

pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();
    if uri.path() != "/" {
        if let Some(path) = uri.path().strip_suffix('/') {
            let mut parts = uri.clone().into_parts();
            parts.path_and_query = Some(if let Some(query) = uri.query() {
                format!("{path}?{query}").parse().unwrap()
            } else {
                path.parse().unwrap()
            });
            let new_uri = Uri::from_parts(parts).unwrap();
            return Redirect::permanent(&new_uri.to_string()).into_response();
        }
    }
    next.run(req).await
}

/// Spec §6: bearer token required for non-loopback binds. Also accepts a
/// scoped token minted for a spawned script/test (`ScriptRunner::validate_token`).
pub async fn require_bearer_auth(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if !state.config.auth_required() {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let token = match token {
        Some(t) => t,
        None => return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response(),
    };

    if Some(token) == state.config.bearer_token.as_deref() {
        return next.run(req).await;
    }
    if state.scripts.validate_token(token).await {
        return next.run(req).await;
    }

    (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response()
}
