//! `POST /upload`: the thin ingress producer.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::{debug, warn};

use wall_core::Submission;

use super::AppState;
use crate::context::SubmitOutcome;

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: &'static str,
    id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// POST /upload
///
/// The raw request body is the photo. Validation of the media itself
/// happens upstream.
pub(super) async fn upload(State(state): State<AppState>, body: Bytes) -> Response {
    if body.is_empty() {
        return error(StatusCode::BAD_REQUEST, "empty upload");
    }

    let size = body.len();
    let submission = Submission::new(body.to_vec());

    match state.ctx.submit(submission).await {
        Ok(SubmitOutcome::Queued(id)) => {
            debug!(submission = %id, size, "Upload queued");
            (
                StatusCode::ACCEPTED,
                Json(UploadResponse {
                    status: "queued",
                    id: id.to_string(),
                }),
            )
                .into_response()
        }
        Ok(SubmitOutcome::PublishedDirect(id)) => (
            StatusCode::ACCEPTED,
            Json(UploadResponse {
                status: "published_direct",
                id: id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(size, error = %e, "Upload rejected");
            error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}
