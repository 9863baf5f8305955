use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;

use crate::service::TabService;

#[derive(Clone)]
pub struct SseState {
    pub service: TabService,
}

pub fn router(service: TabService) -> Router {
    let state = SseState { service };

    Router::new()
        .route("/sse/tabs", get(subscribe_to_open_tabs))
        .with_state(state)
}

/// Stream open-tab snapshots as `tabs` events, one per change.
async fn subscribe_to_open_tabs(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let snapshots = state.service.subscribe_open_tabs();

    let stream = async_stream::stream! {
        let mut snapshots = Box::pin(snapshots);
        while let Some(tabs) = snapshots.next().await {
            match Event::default().event("tabs").json_data(&tabs) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Failed to encode tab snapshot: {}", e),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}
