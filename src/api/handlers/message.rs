//! Message handlers: single publish, fetch-and-remove, and the streaming
//! upgrade route.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;

use crate::api::dto::{QueuePath, QueueQuery};
use crate::api::extract::QueueContext;
use crate::app_state::AppState;
use crate::domain::message::header_text;
use crate::domain::options::expiration_ms;
use crate::domain::{Delivery, Headers, OutboundMessage};
use crate::error::{ErrorResponse, GatewayError};
use crate::ws::handler::stream_messages;

/// Request headers with this prefix are copied onto the message.
const MESSAGE_HEADER_PREFIX: &str = "x-msg-x-";

/// `POST /v2/{project}/queues/{queue}/messages` — Publish one message.
///
/// The raw request body is the message content. `Content-Type` and every
/// `x-msg-x-*` header travel with the message.
///
/// # Errors
///
/// Returns [`GatewayError`] on an oversized body, a missing queue or a
/// failed broker confirm.
#[utoipa::path(
    post,
    path = "/v2/{project}/queues/{queue}/messages",
    tag = "Messages",
    summary = "Publish a message",
    description = "Publishes the raw body to the queue and answers once the broker confirms it.",
    params(QueuePath, QueueQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Message confirmed by the broker"),
        (status = 400, description = "Invalid TTL, project ID or queue name", body = ErrorResponse),
        (status = 404, description = "Queue not found", body = ErrorResponse),
        (status = 413, description = "Message too large", body = ErrorResponse),
        (status = 500, description = "Broker error", body = ErrorResponse),
    )
)]
pub async fn publish_message(
    State(state): State<AppState>,
    mut ctx: QueueContext,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let result = publish(&state, &mut ctx, &headers, body).await;
    ctx.finish(result).await?;
    Ok(StatusCode::CREATED)
}

async fn publish(
    state: &AppState,
    ctx: &mut QueueContext,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(), GatewayError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge("Message too large.".to_string())
        } else {
            GatewayError::InvalidArgument(rejection.body_text())
        }
    })?;
    state
        .queues
        .ensure_exists(&mut ctx.channel, &ctx.scope)
        .await?;

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let message = OutboundMessage::new(
        body,
        expiration_ms(ctx.options.ttl, state.config.max_ttl_secs),
    )
    .with_content_type(content_type)
    .with_headers(message_headers(headers));

    state.queues.publish(&ctx.channel, &ctx.scope, message).await
}

/// `DELETE /v2/{project}/queues/{queue}/messages` — Take one message.
///
/// # Errors
///
/// Returns [`GatewayError`] on a missing queue or broker failure.
#[utoipa::path(
    delete,
    path = "/v2/{project}/queues/{queue}/messages",
    tag = "Messages",
    summary = "Fetch and remove one message",
    description = "Removes the message at the head of the queue and returns its content. Metadata travels in `x-msg-timestamp`, `x-msg-redelivered` and the message's own custom headers.",
    params(QueuePath, QueueQuery),
    responses(
        (status = 200, description = "Message content", body = Vec<u8>, content_type = "application/octet-stream"),
        (status = 204, description = "Queue is empty"),
        (status = 404, description = "Queue not found", body = ErrorResponse),
        (status = 500, description = "Broker error", body = ErrorResponse),
    )
)]
pub async fn take_message(
    State(state): State<AppState>,
    mut ctx: QueueContext,
) -> Result<Response, GatewayError> {
    let result = take(&state, &mut ctx).await;
    let delivery = ctx.finish(result).await?;
    Ok(match delivery {
        Some(delivery) => delivery_response(delivery),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn take(state: &AppState, ctx: &mut QueueContext) -> Result<Option<Delivery>, GatewayError> {
    state
        .queues
        .ensure_exists(&mut ctx.channel, &ctx.scope)
        .await?;
    state.queues.take_one(&ctx.channel, &ctx.scope).await
}

/// Collects `x-msg-x-*` request headers verbatim.
fn message_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with(MESSAGE_HEADER_PREFIX))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect()
}

/// Message headers are applied after the `x-msg-*` metadata; only
/// `Content-Type` is set after them.
fn delivery_response(delivery: Delivery) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(timestamp) = delivery.timestamp {
        headers.insert("x-msg-timestamp", HeaderValue::from(timestamp));
    }
    headers.insert(
        "x-msg-redelivered",
        HeaderValue::from_static(if delivery.redelivered { "true" } else { "false" }),
    );
    for (key, value) in &delivery.headers {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&header_text(value)),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %key, "message header not representable in HTTP; skipped"),
        }
    }
    if let Ok(content_type) = HeaderValue::from_str(delivery.content_type_or_default()) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    (StatusCode::OK, headers, delivery.body).into_response()
}

/// Message routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/v2/{project}/queues/{queue}/messages",
        post(publish_message)
            .delete(take_message)
            .get(stream_messages),
    )
}
