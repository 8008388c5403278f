//! Server-Sent Events for live task progress.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::watch;

use crate::transfer::{ProgressSnapshot, TaskState};

use super::error::ApiResult;
use super::state::SharedState;

/// Interval between keepalive comments while a task is idle.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Payload of every progress event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// `progress`, `complete` or `error`
    #[serde(rename = "type")]
    pub event_type: &'static str,
    /// Snapshot at the time of the event
    #[serde(flatten)]
    pub snapshot: ProgressSnapshot,
    /// Reason for an `error` event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    fn from_snapshot(snapshot: ProgressSnapshot) -> Self {
        let (event_type, message) = match snapshot.state {
            TaskState::Completed => ("complete", None),
            TaskState::Failed => ("error", Some("Transfer failed".to_string())),
            TaskState::Cancelled => ("error", Some("Transfer cancelled".to_string())),
            TaskState::Pending | TaskState::Active | TaskState::Paused => ("progress", None),
        };
        Self {
            event_type,
            snapshot,
            message,
        }
    }

    fn into_event(self) -> Event {
        Event::default()
            .event(self.event_type)
            .data(serde_json::to_string(&self).unwrap_or_default())
    }
}

enum Phase {
    Initial,
    Watching,
    Done,
}

/// GET /api/file/transfer/{task_id}/events - Stream progress updates.
///
/// The current snapshot is sent at once, then one event per change. The
/// stream ends after the terminal `complete` or `error` event.
pub async fn task_events(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = state.coordinator.subscribe(&task_id).await?;
    tracing::debug!(task_id, "Progress subscriber attached");
    Ok(Sse::new(progress_stream(rx)).keep_alive(KeepAlive::default()))
}

fn progress_stream(
    rx: watch::Receiver<ProgressSnapshot>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, Phase::Initial), |(mut rx, phase)| async move {
        match phase {
            Phase::Done => None,
            Phase::Initial => {
                let snapshot = rx.borrow_and_update().clone();
                Some(emit(snapshot, rx))
            }
            Phase::Watching => {
                match tokio::time::timeout(KEEPALIVE_INTERVAL, rx.changed()).await {
                    Ok(Ok(())) => {
                        let snapshot = rx.borrow_and_update().clone();
                        Some(emit(snapshot, rx))
                    }
                    // Session dropped without a terminal update.
                    Ok(Err(_)) => None,
                    Err(_) => Some((
                        Ok(Event::default().comment("keepalive")),
                        (rx, Phase::Watching),
                    )),
                }
            }
        }
    })
}

fn emit(
    snapshot: ProgressSnapshot,
    rx: watch::Receiver<ProgressSnapshot>,
) -> (
    Result<Event, Infallible>,
    (watch::Receiver<ProgressSnapshot>, Phase),
) {
    let next = if snapshot.state.is_terminal() {
        Phase::Done
    } else {
        Phase::Watching
    };
    (
        Ok(ProgressEvent::from_snapshot(snapshot).into_event()),
        (rx, next),
    )
}
