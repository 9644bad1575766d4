//! Notification submission.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::post,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::CreateNotificationRequest;
use crate::api::server::AppState;
use crate::domain::Notification;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications/", post(create_notification))
        .route("/notifications", post(create_notification))
}

/// Assign identity, enqueue, and answer `202 Accepted`.
///
/// Acceptance means the broker holds the message, not that it was delivered.
async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Notification>)> {
    let Json(request) = payload?;
    request.validate()?;

    let notification = Notification::new(request.into_new_notification());

    state.publisher.publish(&notification).await.map_err(|e| {
        tracing::error!(
            notification_id = %notification.id,
            error = %e,
            "Failed to enqueue notification"
        );
        ApiError::internal("Failed to process notification")
    })?;

    Ok((StatusCode::ACCEPTED, Json(notification)))
}
