//! Queue operations: short request/response exchanges on a request's
//! already-open channel.

use crate::domain::{Delivery, OutboundMessage, Scope};
use crate::error::GatewayError;
use crate::service::RequestChannel;

/// Stateless coordinator for single-shot queue operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOps;

impl QueueOps {
    /// Declares the queue. Succeeds whether or not it already existed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Broker`] if the declaration fails.
    pub async fn create(&self, channel: &RequestChannel, scope: &Scope) -> Result<(), GatewayError> {
        channel.get()?.assert_queue(scope.as_str()).await.map_err(|err| {
            tracing::error!(%scope, error = %err, "queue declare failed");
            GatewayError::Broker(format!("Unable to create queue: {scope}"))
        })?;
        tracing::info!(%scope, "queue created");
        Ok(())
    }

    /// Deletes the queue.
    ///
    /// The broker acknowledges deletes of missing queues, so existence is
    /// checked first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] on any broker failure; the broker
    /// has closed the channel by then, so it is invalidated.
    pub async fn delete(
        &self,
        channel: &mut RequestChannel,
        scope: &Scope,
    ) -> Result<(), GatewayError> {
        let queue_channel = channel.get()?;
        let deleted = match queue_channel.check_queue(scope.as_str()).await {
            Ok(()) => queue_channel.delete_queue(scope.as_str()).await,
            Err(err) => Err(err),
        };
        if let Err(err) = deleted {
            channel.invalidate();
            return Err(GatewayError::NotFound(err.to_string()));
        }
        tracing::info!(%scope, "queue deleted");
        Ok(())
    }

    /// Checks that the queue exists.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if it does not; the channel is
    /// invalidated.
    pub async fn ensure_exists(
        &self,
        channel: &mut RequestChannel,
        scope: &Scope,
    ) -> Result<(), GatewayError> {
        if let Err(err) = channel.get()?.check_queue(scope.as_str()).await {
            tracing::debug!(%scope, error = %err, "queue check failed");
            channel.invalidate();
            return Err(GatewayError::NotFound(format!(
                "Queue does not exist: {scope}"
            )));
        }
        Ok(())
    }

    /// Publishes one message and waits for the broker's confirm.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Broker`] if the publish or its confirm fails.
    pub async fn publish(
        &self,
        channel: &RequestChannel,
        scope: &Scope,
        message: OutboundMessage,
    ) -> Result<(), GatewayError> {
        let size = message.body.len();
        let confirm = channel
            .get()?
            .publish(scope.as_str(), message)
            .await
            .map_err(|err| GatewayError::Broker(err.to_string()))?;
        confirm
            .await
            .map_err(|err| GatewayError::Broker(err.to_string()))?;
        tracing::debug!(%scope, size, "message published");
        Ok(())
    }

    /// Removes and returns the head of the queue, or `None` if it is empty.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Broker`] if the fetch fails.
    pub async fn take_one(
        &self,
        channel: &RequestChannel,
        scope: &Scope,
    ) -> Result<Option<Delivery>, GatewayError> {
        let channel = channel.get()?;
        channel
            .prefetch(1)
            .await
            .map_err(|err| GatewayError::Broker(err.to_string()))?;
        channel
            .get(scope.as_str())
            .await
            .map_err(|err| GatewayError::Broker(err.to_string()))
    }
}
