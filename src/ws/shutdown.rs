//! Session teardown.
//!
//! Every way a stream session can end funnels through
//! [`Shutdown::shutdown`]: report the error (if any) to the client, close
//! the socket, then close the session's broker channel. Each step is
//! best-effort and only logs its own failure. The shared broker connection
//! is never touched here.

use std::fmt;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};

use crate::broker::BrokerChannel;
use crate::error::GatewayError;

/// Owns the client sink and broker channel of one session.
pub struct Shutdown<S> {
    sink: Option<S>,
    channel: Option<Box<dyn BrokerChannel>>,
}

impl<S> fmt::Debug for Shutdown<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("closed", &self.sink.is_none())
            .field("channel", &self.channel)
            .finish()
    }
}

impl<S> Shutdown<S>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    /// Takes ownership of a session's resources.
    pub fn new(sink: S, channel: Box<dyn BrokerChannel>) -> Self {
        Self {
            sink: Some(sink),
            channel: Some(channel),
        }
    }

    /// Returns `true` once the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// The session's broker channel, until teardown.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] after teardown.
    pub fn channel(&self) -> Result<&dyn BrokerChannel, GatewayError> {
        self.channel
            .as_deref()
            .ok_or_else(|| GatewayError::Internal("session channel is gone".to_string()))
    }

    /// Sends one frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the session is closed or the
    /// send fails.
    pub async fn send(&mut self, message: Message) -> Result<(), GatewayError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(GatewayError::Internal("session is closed".to_string()));
        };
        sink.send(message)
            .await
            .map_err(|err| GatewayError::Internal(err.to_string()))
    }

    /// Tears the session down, reporting `error` to the client first.
    /// Returns `false` if the session was already closed.
    pub async fn shutdown(&mut self, error: Option<GatewayError>) -> bool {
        let Some(mut sink) = self.sink.take() else {
            return false;
        };

        if let Some(error) = error {
            tracing::debug!(error = %error, "closing stream session with error");
            match serde_json::to_string(&error.to_frame()) {
                Ok(frame) => {
                    if let Err(err) = sink.send(Message::text(frame)).await {
                        tracing::warn!(error = %err, "unable to send error frame");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "unable to encode error frame"),
            }
        }

        if let Err(err) = sink.close().await {
            tracing::warn!(error = %err, "socket close failed");
        }
        drop(sink);

        if let Some(channel) = self.channel.take()
            && let Err(err) = channel.close().await
        {
            tracing::warn!(error = %err, "session channel close failed");
        }
        true
    }
}
