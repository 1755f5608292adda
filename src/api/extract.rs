//! Request preamble shared by every queue route.
//!
//! [`QueueContext`] runs the steps every queue request goes through before
//! its handler: scope and parameter validation, connection acquisition for
//! the caller's identity, and opening the request's own channel. Validation
//! happens first, so malformed requests never touch the broker.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query};
use axum::http::request::Parts;

use crate::api::dto::{QueuePath, QueueQuery};
use crate::app_state::AppState;
use crate::broker::BrokerConnection;
use crate::domain::{RequestOptions, Scope};
use crate::error::GatewayError;
use crate::service::{Identity, RequestChannel};

/// Validated scope, options and broker resources for one request.
#[derive(Debug)]
pub struct QueueContext {
    /// Broker queue addressed by the path.
    pub scope: Scope,
    /// Validated query options.
    pub options: RequestOptions,
    /// The identity's shared broker connection.
    pub connection: Arc<dyn BrokerConnection>,
    /// The request's own channel; closed when the request ends.
    pub channel: RequestChannel,
}

impl QueueContext {
    /// Closes the request channel, then passes `result` through. Handlers
    /// call this on the way out so the channel never outlives the response.
    ///
    /// # Errors
    ///
    /// Returns `result`'s error unchanged.
    pub async fn finish<T>(mut self, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        self.channel.close().await;
        result
    }
}

impl FromRequestParts<AppState> for QueueContext {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Path(path) = Path::<QueuePath>::from_request_parts(parts, state)
            .await
            .map_err(|e| GatewayError::InvalidArgument(e.body_text()))?;
        let Query(query) = Query::<QueueQuery>::from_request_parts(parts, state)
            .await
            .map_err(|e| GatewayError::InvalidArgument(e.body_text()))?;

        let scope = Scope::resolve(&path.project, &path.queue)?;
        let options = query.validate(state.config.max_ttl_secs)?;

        let identity = Identity::guest();
        let connection = state.connections.acquire(&identity).await?;
        let channel = RequestChannel::open(connection.as_ref()).await?;

        Ok(Self {
            scope,
            options,
            connection,
            channel,
        })
    }
}
