//! Live event stream over Server-Sent Events.
//!
//! Each connection registers a subscriber on the conversation log and
//! relays events as `data: <json>` frames. A keepalive comment goes out
//! every 15 seconds so idle proxies keep the connection open. A slow
//! client only loses its own events (bounded subscriber queue).

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use super::AppState;

/// Keepalive interval mandated by the stream contract.
const KEEPALIVE_SECS: u64 = 15;

/// `GET /v1/stream/events/subscribe`
pub(super) async fn subscribe_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.conversation.subscribe();
    debug!(subscriber = subscription.id, "sse subscriber connected");

    let stream = ReceiverStream::new(subscription.rx).map(|event| {
        let data = serde_json::to_string(&event)
            .unwrap_or_else(|_| "{}".to_owned());
        Ok(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_SECS))
            .text("keepalive"),
    )
}
