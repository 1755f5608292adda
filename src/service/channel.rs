//! Request-scoped broker channels.
//!
//! Every HTTP request gets its own confirm channel. [`RequestChannel`] ties
//! the channel's lifetime to the request: handlers close it explicitly once
//! the response is ready, and dropping the guard (early `?` return, panic,
//! cancelled request) closes it in the background. Streaming sessions take
//! the channel out with [`RequestChannel::into_session`] and hand it to
//! their own teardown.

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::error::GatewayError;

/// Owns one broker channel for the duration of a request.
#[derive(Debug)]
pub struct RequestChannel {
    channel: Option<Box<dyn BrokerChannel>>,
}

impl RequestChannel {
    /// Opens a confirm channel on the connection.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BrokerUnavailable`] if the broker refuses it.
    pub async fn open(connection: &dyn BrokerConnection) -> Result<Self, GatewayError> {
        let channel = connection.open_confirm_channel().await.map_err(|err| {
            tracing::error!(error = %err, "channel open failed");
            GatewayError::BrokerUnavailable("Unable to create AMQP channel.".to_string())
        })?;
        tracing::trace!("channel opened");
        Ok(Self {
            channel: Some(channel),
        })
    }

    /// Returns the open channel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the channel was already closed
    /// or invalidated.
    pub fn get(&self) -> Result<&dyn BrokerChannel, GatewayError> {
        self.channel
            .as_deref()
            .ok_or_else(|| GatewayError::Internal("request channel is gone".to_string()))
    }

    /// Returns `true` while the request still holds its channel.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.channel.is_some()
    }

    /// Forgets the channel without closing it, after the broker already
    /// closed it because of a failed operation.
    pub fn invalidate(&mut self) {
        self.channel = None;
    }

    /// Closes the channel. Returns `false` if there was nothing to close.
    /// Close failures are logged, never returned.
    pub async fn close(&mut self) -> bool {
        let Some(channel) = self.channel.take() else {
            return false;
        };
        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "channel close failed");
        }
        true
    }

    /// Hands the channel over to a streaming session, which becomes
    /// responsible for closing it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the channel is gone.
    pub fn into_session(mut self) -> Result<Box<dyn BrokerChannel>, GatewayError> {
        self.channel
            .take()
            .ok_or_else(|| GatewayError::Internal("request channel is gone".to_string()))
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = channel.close().await {
                        tracing::debug!(error = %err, "deferred channel close failed");
                    }
                });
            }
            Err(_) => tracing::warn!("channel dropped outside a runtime; left to the broker"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{BrokerClient, MemoryBroker};

    async fn open(broker: &MemoryBroker) -> RequestChannel {
        let Ok(connection) = broker.connect().await else {
            panic!("connect failed");
        };
        let Ok(channel) = RequestChannel::open(connection.as_ref()).await else {
            panic!("channel open failed");
        };
        channel
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = MemoryBroker::new();
        let mut channel = open(&broker).await;
        assert_eq!(broker.open_channels(), 1);

        assert!(channel.close().await);
        assert!(!channel.close().await);
        assert!(!channel.is_held());
        assert!(channel.get().is_err());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn drop_closes_channel() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        drop(channel);
        for _ in 0..50 {
            if broker.open_channels() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn session_handoff_skips_drop_close() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        let Ok(owned) = channel.into_session() else {
            panic!("handoff failed");
        };
        tokio::task::yield_now().await;
        assert_eq!(broker.open_channels(), 1);
        assert!(owned.close().await.is_ok());
    }

    #[tokio::test]
    async fn open_fails_on_closed_connection() {
        let broker = MemoryBroker::new();
        let Ok(connection) = broker.connect().await else {
            panic!("connect failed");
        };
        broker.close_connections("gone");
        let result = RequestChannel::open(connection.as_ref()).await;
        assert!(matches!(result, Err(GatewayError::BrokerUnavailable(_))));
    }
}
