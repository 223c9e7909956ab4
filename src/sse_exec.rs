//! SSE Execution (spec §4.4): streams an upstream `text/event-stream`
//! response as a lazy sequence of envelopes, restartable via `Last-Event-ID`.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde_json::json;

use crate::engine::ExecuteInput;
use crate::error::ApiError;
use crate::ids::new_id;
use crate::model::EventEnvelope;

pub struct SseExecInput {
    pub base: ExecuteInput,
    pub accept_header: Option<String>,
    pub last_event_id: Option<String>,
}

/// Validates that the selected request is eligible for SSE dispatch: either
/// its declared protocol is `sse`, or the caller's `Accept` header includes
/// `text/event-stream`.
pub fn validate_sse_eligible(protocol: &crate::model::Protocol, accept_header: Option<&str>) -> Result<(), ApiError> {
    let accept_ok = accept_header.map(|a| a.contains("text/event-stream")).unwrap_or(false);
    if !matches!(protocol, crate::model::Protocol::Sse) && !accept_ok {
        return Err(ApiError::ValidationError(
            "request is not an SSE request (protocol != sse and Accept does not include text/event-stream)".to_string(),
        ));
    }
    Ok(())
}

/// Builds the lazy SSE stream for `/execute/sse`. The upstream event-stream
/// is forwarded line-by-line as `data:` events carrying our own envelope
/// shape; `lastEventId` is forwarded as `Last-Event-ID` on (re)connection so
/// the upstream can resume mid-stream.
pub async fn execute_sse(
    http: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    last_event_id: Option<&str>,
    run_id: String,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut request = http.get(url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(id) = last_event_id {
        request = request.header("Last-Event-ID", id);
    }

    let response = request.send().await.map_err(|e| ApiError::Execute(e.to_string()))?;
    let mut byte_stream = response.bytes_stream();

    let stream = async_stream::stream! {
        let mut seq: u64 = 0;
        let mut buf = String::new();
        loop {
            match byte_stream.next().await {
                Some(Ok(chunk)) => {
                    buf.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(pos) = buf.find("\n\n") {
                        let raw_event: String = buf.drain(..pos + 2).collect();
                        seq += 1;
                        let envelope = EventEnvelope::new(
                            "fetchFinished",
                            chrono::Utc::now(),
                            &run_id,
                            seq,
                            json!({ "raw": raw_event.trim() }),
                        );
                        if let Ok(data) = serde_json::to_string(&envelope) {
                            yield Ok(Event::default().data(data));
                        }
                    }
                }
                Some(Err(e)) => {
                    seq += 1;
                    let envelope = EventEnvelope::new(
                        "error",
                        chrono::Utc::now(),
                        &run_id,
                        seq,
                        json!({ "message": e.to_string() }),
                    );
                    if let Ok(data) = serde_json::to_string(&envelope) {
                        yield Ok(Event::default().event("error").data(data));
                    }
                    break;
                }
                None => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))))
}

pub fn new_run_id() -> String {
    new_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    #[test]
    fn sse_protocol_is_eligible_without_accept_header() {
        assert!(validate_sse_eligible(&Protocol::Sse, None).is_ok());
    }

    #[test]
    fn http_protocol_with_matching_accept_is_eligible() {
        assert!(validate_sse_eligible(&Protocol::Http, Some("text/event-stream, */*")).is_ok());
    }

    #[test]
    fn http_protocol_without_accept_is_rejected() {
        let err = validate_sse_eligible(&Protocol::Http, Some("application/json")).unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }
}
