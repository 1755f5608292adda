//! AMQP 0-9-1 driver built on `lapin`.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::{
    BrokerChannel, BrokerClient, BrokerConnection, BrokerError, CloseNotifier, CloseSignal,
    Consumer, PendingConfirm,
};
use crate::domain::{Delivery, Headers, OutboundMessage};

/// AMQP reply code for a normal channel close.
const REPLY_SUCCESS: u16 = 200;

/// Delivery mode marking a message persistent.
const PERSISTENT: u8 = 2;

/// Broker client that dials an AMQP URI.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
}

impl AmqpBroker {
    /// Creates a client for the given `amqp://` or `amqps://` URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerClient for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let shared = Arc::new(ConnectionSignals::default());
        let on_error = Arc::clone(&shared);
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "amqp connection error");
            on_error.close_all(&err.to_string());
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            signals: shared,
        }))
    }
}

/// Close notifiers for a connection and the channels opened on it.
/// `lapin` reports failures per connection, so one error fans out to every
/// live channel.
#[derive(Debug, Default)]
struct ConnectionSignals {
    connection: CloseNotifier,
    channels: Mutex<Vec<Weak<CloseNotifier>>>,
}

impl ConnectionSignals {
    fn close_all(&self, reason: &str) {
        self.connection.notify(reason);
        let channels = std::mem::take(
            &mut *self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for notifier in channels.iter().filter_map(Weak::upgrade) {
            notifier.notify(reason);
        }
    }

    fn track(&self, notifier: &Arc<CloseNotifier>) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels.retain(|weak| weak.strong_count() > 0);
        channels.push(Arc::downgrade(notifier));
    }
}

/// A `lapin` connection.
#[derive(Debug)]
pub struct AmqpConnection {
    inner: Connection,
    signals: Arc<ConnectionSignals>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_confirm_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if !self.inner.status().connected() {
            return Err(BrokerError::Closed("amqp connection is closed".to_string()));
        }
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let notifier = Arc::new(CloseNotifier::new());
        self.signals.track(&notifier);
        Ok(Box::new(AmqpChannel {
            inner: channel,
            notifier,
        }))
    }

    fn closed(&self) -> CloseSignal {
        self.signals.connection.subscribe()
    }
}

/// A `lapin` channel in confirm mode.
#[derive(Debug)]
pub struct AmqpChannel {
    inner: Channel,
    notifier: Arc<CloseNotifier>,
}

impl AmqpChannel {
    /// Classifies a driver error. Soft errors close the channel broker-side,
    /// so the close signal fires whenever the channel is no longer usable.
    fn classify(&self, err: &lapin::Error) -> BrokerError {
        let message = err.to_string();
        let connected = self.inner.status().connected();
        if !connected {
            self.notifier.notify(message.clone());
        }
        if message.contains("NOT_FOUND") {
            BrokerError::NotFound(message)
        } else if connected {
            BrokerError::Operation(message)
        } else {
            BrokerError::Closed(message)
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| self.classify(&e))
    }

    async fn check_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        self.inner
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| self.classify(&e))
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| self.classify(&e))
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm, BrokerError> {
        let mut properties = BasicProperties::default()
            .with_timestamp(message.timestamp_ms)
            .with_expiration(ShortString::from(message.expiration_ms.to_string()));
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(content_type) = message.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let confirm = self
            .inner
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| self.classify(&e))?;

        Ok(async move {
            match confirm.await {
                Ok(Confirmation::Nack(_)) => {
                    Err(BrokerError::Operation("publish was nacked".to_string()))
                }
                Ok(_) => Ok(()),
                Err(e) => Err(BrokerError::Operation(e.to_string())),
            }
        }
        .boxed())
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| self.classify(&e))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let message = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
            .map_err(|e| self.classify(&e))?;
        Ok(message.map(|m| to_delivery(m.delivery)))
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(|e| self.classify(&e))?;
        let tag = consumer.tag().as_str().to_string();
        let deliveries = consumer
            .map(|item| {
                item.map(to_delivery)
                    .map_err(|e| BrokerError::Closed(e.to_string()))
            })
            .boxed();
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| self.classify(&e))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.classify(&e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let result = self
            .inner
            .close(REPLY_SUCCESS, "closed by gateway")
            .await
            .map_err(|e| BrokerError::Closed(e.to_string()));
        self.notifier.notify("closed by gateway");
        result
    }

    fn closed(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        timestamp: *properties.timestamp(),
        headers: properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        body: delivery.data.into(),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        serde_json::Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        AMQPValue::Void => Value::Null,
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Value::from(f64::from(*f)),
        AMQPValue::Double(f) => Value::from(*f),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        other => Value::String(format!("{other:?}")),
    }
}
