//! Server-Sent Events support

use crate::publisher::PublishedEvent;
use crate::runtime::WatchGuard;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Live events for one caller, opened with a `ready` event.
///
/// `watching` lives as long as the stream, so a disconnect drops it.
pub fn sse_stream(
    caller_id: String,
    limit_remaining: u64,
    broadcast_rx: tokio::sync::broadcast::Receiver<PublishedEvent>,
    watching: WatchGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ready = serde_json::json!({
        "type": "ready",
        "limit_remaining": limit_remaining,
    });
    let init = futures::stream::once(async move {
        Ok(Event::default().event("ready").data(ready.to_string()))
    });

    let broadcasts = BroadcastStream::new(broadcast_rx).filter_map(move |result| {
        let _watching = &watching;
        match result {
            Ok(event) if event.caller_id() == caller_id => Some(Ok(to_axum_event(&event))),
            Ok(_) => None,
            Err(e) => {
                // Lagged receivers skip ahead; the record store still has the full text
                tracing::warn!(caller_id = %caller_id, error = %e, "SSE subscriber lagged");
                None
            }
        }
    });

    Sse::new(init.chain(broadcasts)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_axum_event(event: &PublishedEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "message": e.to_string() }).to_string()
    });
    Event::default().event(event.event_type()).data(data)
}
