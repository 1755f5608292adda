//! Queue lifecycle handlers: create and delete.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::put;

use crate::api::dto::{QueuePath, QueueQuery};
use crate::api::extract::QueueContext;
use crate::app_state::AppState;
use crate::error::{ErrorResponse, GatewayError};

/// `PUT /v2/{project}/queues/{queue}` — Create a queue.
///
/// # Errors
///
/// Returns [`GatewayError`] on invalid path parameters or broker failure.
#[utoipa::path(
    put,
    path = "/v2/{project}/queues/{queue}",
    tag = "Queues",
    summary = "Create a queue",
    description = "Declares the queue on the broker. Creating an existing queue succeeds again.",
    params(QueuePath, QueueQuery),
    responses(
        (status = 201, description = "Queue exists"),
        (status = 400, description = "Invalid project ID or queue name", body = ErrorResponse),
        (status = 500, description = "Broker error", body = ErrorResponse),
        (status = 503, description = "Broker unavailable", body = ErrorResponse),
    )
)]
pub async fn create_queue(
    State(state): State<AppState>,
    ctx: QueueContext,
) -> Result<impl IntoResponse, GatewayError> {
    let result = state.queues.create(&ctx.channel, &ctx.scope).await;
    ctx.finish(result).await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /v2/{project}/queues/{queue}` — Delete a queue.
///
/// # Errors
///
/// Returns [`GatewayError::NotFound`] if the broker refuses the delete.
#[utoipa::path(
    delete,
    path = "/v2/{project}/queues/{queue}",
    tag = "Queues",
    summary = "Delete a queue",
    description = "Deletes the queue and every message in it.",
    params(QueuePath, QueueQuery),
    responses(
        (status = 204, description = "Queue deleted"),
        (status = 400, description = "Invalid project ID or queue name", body = ErrorResponse),
        (status = 404, description = "Queue not found", body = ErrorResponse),
    )
)]
pub async fn delete_queue(
    State(state): State<AppState>,
    mut ctx: QueueContext,
) -> Result<impl IntoResponse, GatewayError> {
    let result = state.queues.delete(&mut ctx.channel, &ctx.scope).await;
    ctx.finish(result).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Queue lifecycle routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/v2/{project}/queues/{queue}",
        put(create_queue).delete(delete_queue),
    )
}
