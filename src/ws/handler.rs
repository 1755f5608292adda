//! Axum WebSocket upgrade handler.

use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use super::consume::run_consume;
use super::publish::run_publish;
use super::{SessionContext, SessionMode};
use crate::api::extract::QueueContext;
use crate::app_state::AppState;
use crate::broker::BrokerChannel;
use crate::error::GatewayError;
use crate::service::RequestChannel;

/// Slack above the configured message size before the socket itself
/// refuses a frame. Frames in between reach the packet assembler.
const FRAME_HEADROOM: usize = 1024;

/// `GET /v2/{project}/queues/{queue}/messages` — Upgrade to a publish or
/// consume stream.
///
/// The queue must exist and `Sec-WebSocket-Protocol` must be exactly
/// `publish` or `consume`; otherwise the request is answered with a plain
/// HTTP error and no upgrade happens.
///
/// # Errors
///
/// Returns [`GatewayError::NotFound`] for a missing queue and
/// [`GatewayError::InvalidHeader`] for a failed negotiation.
pub async fn stream_messages(
    State(state): State<AppState>,
    mut ctx: QueueContext,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, GatewayError> {
    let negotiated = match state
        .queues
        .ensure_exists(&mut ctx.channel, &ctx.scope)
        .await
    {
        Ok(()) => negotiate(upgrade, &headers),
        Err(err) => Err(err),
    };
    let (upgrade, mode) = match negotiated {
        Ok(negotiated) => negotiated,
        Err(err) => return ctx.finish(Err(err)).await,
    };

    let QueueContext {
        scope,
        options,
        connection,
        channel,
    } = ctx;
    let config = state.config;
    let limit = socket_limit(config.max_message_size);
    tracing::debug!(scope = %scope, mode = mode.as_str(), "upgrading stream session");

    Ok(upgrade
        .protocols([mode.as_str()])
        .max_frame_size(limit)
        .max_message_size(limit)
        .on_failed_upgrade(|err| tracing::warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let Some(channel) = take_channel(channel) else {
                return;
            };
            let session = SessionContext {
                scope,
                channel,
                connection,
                options,
                max_message_size: config.max_message_size,
                max_ttl_secs: config.max_ttl_secs,
                default_limit: config.default_limit,
            };
            run_session(socket, mode, session).await;
        })
        .into_response())
}

fn negotiate(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: &HeaderMap,
) -> Result<(WebSocketUpgrade, SessionMode), GatewayError> {
    let upgrade = upgrade.map_err(|rejection| {
        tracing::debug!(error = %rejection, "upgrade rejected");
        GatewayError::InvalidHeader("Upgrade: WebSocket header expected.".to_string())
    })?;
    let mode = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(SessionMode::from_protocol)
        .ok_or_else(|| {
            GatewayError::InvalidHeader(
                "Sec-Websocket-Protocol must be set to `publish` or `consume`.".to_string(),
            )
        })?;
    Ok((upgrade, mode))
}

fn socket_limit(max_message_size: usize) -> usize {
    max_message_size.saturating_add(FRAME_HEADROOM)
}

fn take_channel(channel: RequestChannel) -> Option<Box<dyn BrokerChannel>> {
    match channel.into_session() {
        Ok(channel) => Some(channel),
        Err(err) => {
            tracing::error!(error = %err, "stream session has no channel");
            None
        }
    }
}

async fn run_session(socket: WebSocket, mode: SessionMode, session: SessionContext) {
    let (sink, incoming) = socket.split();
    match mode {
        SessionMode::Publish => run_publish(sink, incoming, session).await,
        SessionMode::Consume => run_consume(sink, incoming, session).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_limit_sits_above_message_size() {
        assert_eq!(socket_limit(1024), 2048);
        assert_eq!(socket_limit(usize::MAX), usize::MAX);
    }
}
