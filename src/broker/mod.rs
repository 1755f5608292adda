//! Broker capability seam.
//!
//! The gateway never speaks the broker protocol itself. It drives a
//! [`BrokerClient`] to obtain shared [`BrokerConnection`]s and opens one
//! confirm-tracking [`BrokerChannel`] per request or stream session.
//!
//! Two implementations ship with the crate:
//!
//! - [`AmqpBroker`] talks AMQP 0-9-1 through `lapin`.
//! - [`MemoryBroker`] keeps queues in process, selected with a `memory://`
//!   URI and used throughout the test suite.

pub mod amqp;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::sync::watch;

use crate::domain::{Delivery, OutboundMessage};

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Failure reported by a broker driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker cannot be reached or refused the connection.
    #[error("{0}")]
    Unavailable(String),

    /// The addressed queue does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The channel or connection is already closed.
    #[error("{0}")]
    Closed(String),

    /// Any other failed operation.
    #[error("{0}")]
    Operation(String),
}

/// Resolves once the broker confirms (or rejects) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<(), BrokerError>>;

/// Stream of deliveries for one consumer registration. Ends when the
/// consumer is cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An active consumer registration.
pub struct Consumer {
    /// Broker-assigned consumer tag, used to cancel delivery.
    pub tag: String,
    /// Incoming deliveries.
    pub deliveries: DeliveryStream,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}

/// Entry point to a broker: creates connections.
#[async_trait]
pub trait BrokerClient: Send + Sync + fmt::Debug {
    /// Opens a new broker connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] when the broker cannot be reached.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker session, shared by every request of one identity.
#[async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    /// Opens a channel with publisher confirms enabled.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the connection is closed or the broker
    /// refuses the channel.
    async fn open_confirm_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// Signal that fires when the connection errors or closes.
    fn closed(&self) -> CloseSignal;
}

/// A single-conversation broker channel, owned by one request or session.
#[async_trait]
pub trait BrokerChannel: Send + Sync + fmt::Debug {
    /// Declares the queue, succeeding whether or not it already existed.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the broker refuses the declaration.
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Checks that the queue exists without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotFound`] if it does not; the broker closes
    /// the channel in that case.
    async fn check_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Deletes the queue. Like AMQP `queue.delete`, deleting a queue that
    /// does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker rejects the delete.
    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publishes to the default exchange with `routing_key`. The returned
    /// future resolves on the broker's confirm.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the publish cannot be sent.
    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm, BrokerError>;

    /// Sets the maximum number of unacknowledged deliveries.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the channel is closed.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Fetches one message without requiring an ack.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] on failure; an empty queue is `Ok(None)`.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Registers a consumer on the queue.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the queue is missing or the channel is
    /// closed.
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer, BrokerError>;

    /// Acknowledges a delivery, or every outstanding delivery up to and
    /// including it when `multiple` is set.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the tag is unknown or the channel is
    /// closed.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// Cancels a consumer registration.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the channel is closed.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Closes the channel.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the channel was already closed.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Signal that fires when the channel closes for any reason.
    fn closed(&self) -> CloseSignal;
}

/// Observer side of a close notification.
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<Option<String>>);

impl CloseSignal {
    /// Waits until the resource closes, returning the reason.
    pub async fn wait(&mut self) -> String {
        loop {
            let current = self.0.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if self.0.changed().await.is_err() {
                return self
                    .0
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| "dropped".to_string());
            }
        }
    }

    /// Returns `true` once the resource has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Owner side of a close notification. The first reason wins.
#[derive(Debug)]
pub struct CloseNotifier(watch::Sender<Option<String>>);

impl CloseNotifier {
    /// Creates an open notifier.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self(tx)
    }

    /// Marks the resource closed. Returns `false` if it already was.
    pub fn notify(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.0.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Creates a new observer.
    #[must_use]
    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal(self.0.subscribe())
    }

    /// Returns `true` once [`CloseNotifier::notify`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the broker selected by `uri`: `memory://` for the in-process
/// broker, anything else is handed to the AMQP driver.
#[must_use]
pub fn from_uri(uri: &str) -> Arc<dyn BrokerClient> {
    if uri.starts_with("memory://") {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpBroker::new(uri))
    }
}
