use super::{AppState, error::ApiError, request::CalculateBody};
use crate::server::telemetry::{
    increment_calculation_failures, increment_submissions, increment_validation_errors,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use montepi::{Calculation, CalculationRef, Error, HistoryEntry};

/// `POST /api/calculate`
///
/// Single-mode requests run to completion before responding with `201`.
/// Distributed requests respond `202` as soon as their chunks are queued.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub async fn calculate(
    State(state): State<AppState>,
    Json(body): Json<CalculateBody>,
) -> Result<(StatusCode, Json<Calculation>), ApiError> {
    if state.streams.is_refusing() {
        return Err(Error::ServiceShutdown.into());
    }

    let request = body.validate().inspect_err(|_| increment_validation_errors())?;
    increment_submissions(request.mode.as_str());

    match state.service.submit(request).await {
        Ok(submission) => {
            let status = if submission.accepted {
                StatusCode::ACCEPTED
            } else {
                StatusCode::CREATED
            };
            Ok((status, Json(submission.calculation)))
        }
        Err(err @ Error::InvalidRequest { .. }) => {
            increment_validation_errors();
            Err(err.into())
        }
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("calculation failed: {err}");
            increment_calculation_failures();
            Err(ApiError::CalculationFailed(err))
        }
    }
}

/// `GET /api/calculate/{calculation}`
pub async fn show(
    State(state): State<AppState>,
    Path(calculation): Path<String>,
) -> Result<Json<Calculation>, ApiError> {
    let reference: CalculationRef = calculation.parse()?;
    Ok(Json(state.service.fetch(reference).await?))
}

/// `GET /api/calculate/{calculation}/stream`
///
/// One `update` event per progress snapshot. The stream ends after the
/// terminal snapshot, after the snapshot limit, when the client disconnects,
/// or when the server shuts down.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(state)))]
pub async fn stream(
    State(state): State<AppState>,
    Path(calculation): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let reference: CalculationRef = calculation.parse()?;
    let guard = state.streams.open().ok_or(Error::ServiceShutdown)?;
    let snapshots = state.service.stream(reference).await?;

    let events = snapshots
        .take_until(state.streams.cancelled())
        .map(move |snapshot| {
            // Keeps the slot open for as long as the stream lives.
            let _ = &guard;
            Event::default().event("update").json_data(&snapshot)
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `GET /api/history`
pub async fn history(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    Ok(Json(state.service.history().await?))
}

/// `GET /healthz`
pub async fn health() -> &'static str {
    "ok"
}
