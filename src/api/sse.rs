//! Server-Sent Events support

use crate::runtime::TurnHandle;
use crate::transport::{EventFramer, EventRecord, TextDelivery};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Stream a running turn as numbered events.
///
/// Dropping the stream (client disconnect) closes the event channel, which
/// cancels the turn.
pub fn turn_stream(
    handle: TurnHandle,
    delivery: TextDelivery,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut framer = EventFramer::new(delivery, &handle.turn_id, &handle.conversation_id);
    let events = ReceiverStream::new(handle.into_events())
        .filter_map(move |event| framer.frame(event).map(|record| Ok(record_to_axum(&record))));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn record_to_axum(record: &EventRecord) -> Event {
    let event = Event::default().event(record.event.name());
    match serde_json::to_string(record) {
        Ok(data) => event.data(data),
        Err(e) => {
            tracing::error!(turn_id = %record.turn_id, error = %e, "Failed to encode event");
            event.data("{}")
        }
    }
}
