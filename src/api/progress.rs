//! Server-pushed progress stream

use std::pin::Pin;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::progress::ProgressEvent;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

fn to_sse_event(event: ProgressEvent) -> Result<Event, axum::Error> {
    Event::default().id(event.seq.to_string()).json_data(&event)
}

/// Stream a job's progress as server-sent events
///
/// The full event sequence is replayed from 0 (or from `Last-Event-ID` on
/// reconnect), then live events follow until the terminal event, after
/// which the stream ends. Subscribing to an already-terminal job yields a
/// single final-state event.
#[utoipa::path(
    get,
    path = "/progress/{job_id}",
    tag = "jobs",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "text/event-stream of progress events"),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse)
    )
)]
pub async fn progress(
    State(state): State<crate::AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> AppResult<Sse<EventStream>> {
    let after_seq = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let (replay, live) = state.orchestrator.subscribe(job_id, after_seq)?;
    tracing::debug!(%job_id, replayed = replay.len(), live = live.is_some(), "progress subscriber joined");

    let replay_stream = tokio_stream::iter(replay);
    let stream: EventStream = match live {
        Some(receiver) => {
            // A lagged receiver drops the oldest events; the subscriber
            // observes the sequence gap and refreshes via /status.
            let live_stream = BroadcastStream::new(receiver).filter_map(|item| item.ok());
            Box::pin(replay_stream.chain(live_stream).map(to_sse_event))
        }
        None => Box::pin(replay_stream.map(to_sse_event)),
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
