//! Consume sessions.
//!
//! The session sets the channel prefetch, registers a consumer and streams
//! every delivery to the client. An empty client frame cancels the
//! consumer; the socket stays open so outstanding deliveries can still be
//! acked.

use std::fmt;

use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt, stream};

use super::SessionContext;
use super::messages::{Command, Frame, delivery_frames, parse_command, read_failure};
use super::shutdown::Shutdown;
use crate::broker::{BrokerChannel, Consumer, DeliveryStream};
use crate::domain::{Delivery, RequestOptions, Scope};
use crate::error::GatewayError;

/// Runs a consume session until the client leaves or something fails.
pub async fn run_consume<S, R, E>(sink: S, mut incoming: R, session: SessionContext)
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
        options,
        default_limit,
        ..
    } = session;
    let mut channel_closed = channel.closed();
    let mut connection_closed = connection.closed();
    let mut shutdown = Shutdown::new(sink, channel);

    let prefetch = options.limit.unwrap_or(default_limit);
    let started = match shutdown.channel() {
        Ok(channel) => start(channel, &scope, prefetch, !options.lock).await,
        Err(err) => Err(err),
    };
    let Consumer {
        tag,
        mut deliveries,
    } = match started {
        Ok(consumer) => consumer,
        Err(err) => {
            shutdown.shutdown(Some(err)).await;
            return;
        }
    };
    tracing::debug!(scope = %scope, consumer = %tag, prefetch, lock = options.lock, "consume session started");
    let mut cancelled = false;

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
                let command = match parse_command(&frame, options.lock) {
                    Ok(command) => command,
                    Err(err) => break Some(err),
                };
                let channel = match shutdown.channel() {
                    Ok(channel) => channel,
                    Err(err) => break Some(err),
                };
                match command {
                    Command::Cancel if cancelled => {}
                    Command::Cancel => {
                        if let Err(err) = channel.cancel(&tag).await {
                            tracing::warn!(scope = %scope, error = %err, "consumer cancel failed");
                            break Some(GatewayError::Internal(
                                "Unable to cancel message delivery.".to_string(),
                            ));
                        }
                        tracing::debug!(scope = %scope, consumer = %tag, "consumer cancelled");
                        cancelled = true;
                    }
                    Command::Ack { delivery_tag, multiple } => {
                        if let Err(err) = channel.ack(delivery_tag, multiple).await {
                            tracing::warn!(scope = %scope, delivery_tag, error = %err, "ack failed");
                            break Some(GatewayError::Internal("Unable to ack a message.".to_string()));
                        }
                    }
                }
            }
            delivery = deliveries.next() => match delivery {
                Some(Ok(delivery)) => {
                    if let Err(err) = forward(&mut shutdown, &delivery, &options).await {
                        break Some(err);
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(scope = %scope, error = %err, "delivery failed");
                    break Some(GatewayError::Broker("AMQP channel unexpectedly closed.".to_string()));
                }
                None if cancelled => {
                    deliveries = idle();
                }
                None => break Some(GatewayError::Broker("AMQP channel unexpectedly closed.".to_string())),
            },
            reason = channel_closed.wait() => {
                tracing::warn!(scope = %scope, reason = %reason, "channel closed under consume session");
                break Some(GatewayError::Broker(format!(
                    "AMQP channel unexpectedly closed. Details: {reason}"
                )));
            }
            reason = connection_closed.wait() => {
                tracing::warn!(scope = %scope, reason = %reason, "connection closed under consume session");
                break Some(GatewayError::Broker(
                    "AMQP connection was unexpectedly closed.".to_string(),
                ));
            }
        }
    };

    shutdown.shutdown(error).await;
    tracing::debug!(scope = %scope, "consume session ended");
}

async fn start(
    channel: &dyn BrokerChannel,
    scope: &Scope,
    prefetch: u16,
    no_ack: bool,
) -> Result<Consumer, GatewayError> {
    channel.prefetch(prefetch).await?;
    channel.consume(scope.as_str(), no_ack).await.map_err(|err| {
        tracing::warn!(scope = %scope, error = %err, "consume failed");
        GatewayError::Broker("AMQP channel unexpectedly closed.".to_string())
    })
}

async fn forward<S>(
    shutdown: &mut Shutdown<S>,
    delivery: &Delivery,
    options: &RequestOptions,
) -> Result<(), GatewayError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    for frame in delivery_frames(delivery, options.lock, options.encoding) {
        shutdown.send(frame).await.map_err(|err| {
            tracing::debug!(error = %err, "delivery send failed");
            GatewayError::Internal("Unable to send message to client.".to_string())
        })?;
    }
    Ok(())
}

/// Stand-in for a cancelled consumer's finished stream.
fn idle() -> DeliveryStream {
    stream::pending().boxed()
}
