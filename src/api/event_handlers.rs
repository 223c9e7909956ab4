//! `GET /event?sessionId&flowId` (spec §6, §4.6): SSE subscription to the
//! Event Bus, filtered by session and/or flow.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "flowId")]
    pub flow_id: Option<String>,
}

pub async fn subscribe_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscriber_id, rx) = state.events.subscribe(query.session_id, query.flow_id).await;
    let events = state.events.clone();

    let stream = ReceiverStream::new(rx).map(move |envelope| {
        let data = serde_json::to_string(&envelope).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    let guarded = async_stream::stream! {
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            yield item;
        }
        events.unsubscribe(&subscriber_id).await;
    };

    Sse::new(guarded).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}
