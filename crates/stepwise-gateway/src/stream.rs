use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tracing::{debug, error};

use stepwise_core::event::ExecutionEvent;
use stepwise_engine::RunHandle;

/// Turn a run into an SSE response: one frame per event, named after its
/// kind, then a closing `done` frame carrying the run summary.
pub fn run_events(handle: RunHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let RunHandle {
        run_id,
        events,
        outcome,
    } = handle;

    let frames = stream::unfold(events, |mut rx| async move {
        let event = rx.recv().await?;
        Some((event_frame(&event), rx))
    });

    let done = stream::once(async move {
        let summary = match outcome.await {
            Ok(summary) => serde_json::to_value(&summary).unwrap_or_default(),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run task panicked");
                json!({
                    "runId": run_id,
                    "status": "failed",
                    "error": {"kind": "internal", "message": e.to_string()},
                })
            }
        };
        debug!(run_id = %run_id, "Run stream closed");
        Event::default().event("done").data(summary.to_string())
    });

    Sse::new(frames.chain(done).map(Ok)).keep_alive(KeepAlive::default())
}

fn event_frame(event: &ExecutionEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.event_kind.as_str()).data(data)
}
