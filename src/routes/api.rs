//! Scheduling intake.

use std::time::Duration;

use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::{
    config::MAX_DELETE_DELAY_SECS as MAX_DELAY_SECS,
    engine::{MetricsSnapshot, ScheduleKind},
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleRequest {
    pub chat_id: i64,
    pub message_id: i64,
    /// Defaults to the configured delete delay.
    #[serde(default)]
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub kind: ScheduleKind,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    /// False when the message is already pending or the service is stopping.
    pub accepted: bool,
}

/// Error response for API requests.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[tracing::instrument(name = "api.schedule", skip_all)]
pub async fn schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    if let Some(secs) = request.delay_secs
        && secs > MAX_DELAY_SECS
    {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_delay",
            format!("delay_secs must be at most {MAX_DELAY_SECS}"),
        ));
    }

    let accepted = state.scheduler.schedule(
        request.chat_id,
        request.message_id,
        request.delay_secs.map(Duration::from_secs),
        request.kind,
    );

    tracing::debug!(
        chat_id = request.chat_id,
        message_id = request.message_id,
        accepted,
        "Schedule request handled"
    );
    Ok(Json(ScheduleResponse { accepted }))
}

#[tracing::instrument(name = "api.metrics_snapshot", skip(state))]
pub async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.scheduler.metrics_snapshot())
}
