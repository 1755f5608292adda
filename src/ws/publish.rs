//! Publish sessions.
//!
//! Client frames are reassembled into packets and published as they
//! complete. Confirms are pipelined: the loop keeps reading frames while
//! earlier publishes are in flight, and acknowledges each confirm to the
//! client in publish order.

use std::fmt;

use axum::extract::ws::Message;
use futures_util::stream::FuturesOrdered;
use futures_util::{Sink, Stream, StreamExt};

use super::SessionContext;
use super::messages::{Frame, PacketAssembler, confirm_frame, read_failure};
use super::shutdown::Shutdown;
use crate::broker::PendingConfirm;
use crate::error::GatewayError;

/// Runs a publish session until the client leaves or something fails.
pub async fn run_publish<S, R, E>(sink: S, mut incoming: R, session: SessionContext)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let SessionContext {
        scope,
        channel,
        connection,
        max_message_size,
        max_ttl_secs,
        ..
    } = session;
    let mut channel_closed = channel.closed();
    let mut connection_closed = connection.closed();
    let mut shutdown = Shutdown::new(sink, channel);
    let mut assembler = PacketAssembler::new(max_message_size, max_ttl_secs);
    let mut confirms: FuturesOrdered<PendingConfirm> = FuturesOrdered::new();
    tracing::debug!(scope = %scope, "publish session started");

    let error = loop {
        tokio::select! {
            frame = incoming.next() => {
                let message = match frame {
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "client socket failed");
                        break read_failure(&err);
                    }
                    Some(Ok(message)) => message,
                };
                let Some(frame) = Frame::from_message(message) else {
                    continue;
                };
                let outbound = match assembler.accept(frame) {
                    Ok(Some(outbound)) => outbound,
                    Ok(None) => continue,
                    Err(err) => break Some(err),
                };
                let published = match shutdown.channel() {
                    Ok(channel) => channel.publish(scope.as_str(), outbound).await,
                    Err(err) => break Some(err),
                };
                match published {
                    Ok(pending) => confirms.push_back(pending),
                    Err(err) => {
                        tracing::warn!(scope = %scope, error = %err, "publish failed");
                        break Some(GatewayError::Broker("Unable to publish message.".to_string()));
                    }
                }
            }
            Some(confirmed) = confirms.next(), if !confirms.is_empty() => {
                if let Err(err) = confirmed {
                    tracing::warn!(scope = %scope, error = %err, "publish not confirmed");
                    break Some(GatewayError::Broker("Unable to publish message.".to_string()));
                }
                if shutdown.send(confirm_frame()).await.is_err() {
                    break Some(GatewayError::Internal(
                        "Unable to send confirmation to the client.".to_string(),
                    ));
                }
            }
            reason = channel_closed.wait() => {
                tracing::warn!(scope = %scope, reason = %reason, "channel closed under publish session");
                break Some(GatewayError::Broker("AMQP channel was closed.".to_string()));
            }
            reason = connection_closed.wait() => {
                tracing::warn!(scope = %scope, reason = %reason, "connection closed under publish session");
                break Some(GatewayError::Broker(
                    "AMQP connection was unexpectedly closed.".to_string(),
                ));
            }
        }
    };

    shutdown.shutdown(error).await;
    tracing::debug!(scope = %scope, "publish session ended");
}
