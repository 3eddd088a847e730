//! API route definitions.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::{ApiError, ApiResponse};
use crate::scheduler::{
    HistoryRecord, RunHandle, RunParameters, SchedulerStatus, StartError, StopError,
};

/// Upper bound for `?limit=` on the history listing.
const MAX_HISTORY_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(start_run))
        .route("/runs/stop", post(stop_run))
        .route("/runs/status", get(run_status))
        .route("/schedule", delete(disarm_schedule))
        .route("/events", get(events))
        .route("/history", get(list_history))
}

impl From<StartError> for ApiError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::InvalidParameters(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_parameters", e.to_string())
            }
            StartError::AlreadyRunning => {
                ApiError::new(StatusCode::CONFLICT, "already_running", e.to_string())
            }
        }
    }
}

impl From<StopError> for ApiError {
    fn from(e: StopError) -> Self {
        match e {
            StopError::NoActiveRun => {
                ApiError::new(StatusCode::CONFLICT, "no_active_run", e.to_string())
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    phase: String,
    observers: usize,
}

async fn health(State(state): State<AppState>) -> Json<ApiResponse<Health>> {
    ApiResponse::new(Health {
        status: "ok",
        phase: state.scheduler.phase().to_string(),
        observers: state.scheduler.events().observer_count(),
    })
}

async fn start_run(
    State(state): State<AppState>,
    payload: Result<Json<RunParameters>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<RunHandle>>), ApiError> {
    let Json(params) = payload.map_err(|rejection| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_parameters",
            rejection.body_text(),
        )
    })?;

    let handle = state.scheduler.start(params)?;
    Ok((StatusCode::ACCEPTED, ApiResponse::new(handle)))
}

#[derive(Debug, Serialize)]
struct StopAccepted {
    status: &'static str,
}

async fn stop_run(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<StopAccepted>>), ApiError> {
    state.scheduler.stop()?;
    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::new(StopAccepted { status: "stopping" }),
    ))
}

async fn run_status(State(state): State<AppState>) -> Json<ApiResponse<SchedulerStatus>> {
    ApiResponse::new(state.scheduler.status())
}

#[derive(Debug, Serialize)]
struct Disarmed {
    disarmed: bool,
}

async fn disarm_schedule(State(state): State<AppState>) -> Json<ApiResponse<Disarmed>> {
    ApiResponse::new(Disarmed {
        disarmed: state.scheduler.disarm(),
    })
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<HistoryRecord>>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.history_limit)
        .clamp(1, MAX_HISTORY_LIMIT);
    let records = state.scheduler.list_history(Some(limit)).map_err(|e| {
        tracing::error!("history query failed: {:#}", e);
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "history query failed",
        )
    })?;
    Ok(ApiResponse::new(records))
}

/// Server-sent event stream of run progress and completion. Ends when the
/// server shuts down.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.scheduler.subscribe();
    let stream = stream::unfold(
        (subscription, state.shutdown),
        |(mut subscription, shutdown)| async move {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return None,
                event = subscription.recv() => event?,
            };
            let sse = Event::default()
                .event(event.name())
                .json_data(&event)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            Some((Ok(sse), (subscription, shutdown)))
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}
