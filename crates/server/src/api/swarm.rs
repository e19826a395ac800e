//! # Swarm API
//!
//! Run, cancel and observe the pipeline over HTTP. Only one run is active at
//! a time; a second `run` while busy gets `409 Conflict`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use hivemind_core::swarm::{LastRun, SwarmOptions};

use crate::SharedState;

const HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub killed: usize,
}

#[derive(Debug, Serialize)]
pub struct LastRunResponse {
    pub last_run: Option<LastRun>,
}

pub fn swarm_routes() -> Router<SharedState> {
    Router::new()
        .route("/run", post(run_swarm))
        .route("/cancel", post(cancel_swarm))
        .route("/last-run", get(last_run))
}

/// Runs the pipeline to completion and returns the result. The run lives in
/// its own task so a client disconnect does not abandon it halfway.
async fn run_swarm(
    State(state): State<SharedState>,
    Json(options): Json<SwarmOptions>,
) -> Response {
    tracing::info!(prompt = %options.prompt, "Starting pipeline run");
    let orchestrator = Arc::clone(&state.orchestrator);
    let run = tokio::spawn(async move { orchestrator.try_run_swarm_pipeline(options).await });

    match run.await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(busy)) => (
            StatusCode::CONFLICT,
            Json(ApiResponse {
                success: false,
                message: busy.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Pipeline task panicked: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse {
                    success: false,
                    message: "Pipeline task failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn cancel_swarm(State(state): State<SharedState>) -> Json<CancelResponse> {
    let running = state.orchestrator.is_running();
    let killed = state.orchestrator.cancel_swarm();
    Json(CancelResponse {
        cancelled: running,
        killed,
    })
}

async fn last_run(State(state): State<SharedState>) -> Json<LastRunResponse> {
    Json(LastRunResponse {
        last_run: state.orchestrator.last_pipeline_run_time(),
    })
}

/// SSE endpoint for pipeline events, with a heartbeat comment when idle
pub async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.event_tx.subscribe()).filter_map(|item| match item {
        Ok(event) => Some(Ok(Event::default()
            .event(event_name(&event.kind))
            .data(serde_json::to_string(&event).unwrap_or_default()))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "SSE subscriber lagged behind");
            None
        }
    });

    let heartbeat = stream::unfold((), |_| async {
        tokio::time::sleep(HEARTBEAT).await;
        Some((Ok(Event::default().comment("heartbeat")), ()))
    });

    Sse::new(events.merge(heartbeat)).keep_alive(KeepAlive::default())
}

fn event_name(kind: &hivemind_core::swarm::SwarmEventKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "event".to_string())
}
