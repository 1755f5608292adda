//! In-process broker.
//!
//! Emulates the parts of AMQP 0-9-1 the gateway relies on: durable named
//! queues behind the default exchange, channel-scoped delivery tags,
//! prefetch windows, single and cumulative acks, requeue of unacked
//! deliveries when their channel closes, and channel invalidation after a
//! failed queue operation. All state lives behind one mutex that is never
//! held across an `.await`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;

use super::{
    BrokerChannel, BrokerClient, BrokerConnection, BrokerError, CloseNotifier, CloseSignal,
    Consumer, PendingConfirm,
};
use crate::domain::{Delivery, OutboundMessage};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Debug, Clone)]
struct StoredMessage {
    message: OutboundMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    tx: DeliverySender,
}

#[derive(Debug, Default)]
struct MemQueue {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

#[derive(Debug)]
struct ChannelState {
    connection_id: u64,
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    notifier: Arc<CloseNotifier>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, MemQueue>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, Arc<CloseNotifier>>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id = self.next_id.saturating_add(1);
        self.next_id
    }

    /// Hands ready messages to consumers with spare prefetch capacity,
    /// round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|c| !c.tx.is_closed());

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|idx| {
                    queue.consumers.get(*idx).is_some_and(|c| {
                        c.no_ack || channels.get(&c.channel_id).is_some_and(ChannelState::has_capacity)
                    })
                });
            let Some(idx) = chosen else {
                break;
            };
            let (Some(consumer), Some(stored)) = (queue.consumers.get(idx), queue.ready.pop_front())
            else {
                break;
            };
            queue.cursor = (idx + 1) % count;
            let no_ack = consumer.no_ack;

            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                queue.ready.push_front(stored);
                break;
            };
            channel.next_tag = channel.next_tag.saturating_add(1);
            let tag = channel.next_tag;
            if consumer.tx.send(Ok(to_delivery(tag, &stored))).is_err() {
                queue.ready.push_front(stored);
                queue.consumers.remove(idx);
                queue.cursor = 0;
                continue;
            }
            if !no_ack {
                channel
                    .unacked
                    .insert(tag, (queue_name.to_string(), stored));
            }
        }
    }

    fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Closes a channel: drops its consumers, requeues its unacked
    /// deliveries as redelivered and fires its close signal.
    fn close_channel(&mut self, channel_id: u64, reason: &str) -> bool {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return false;
        };
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
            queue.cursor = 0;
        }
        for (_, (queue_name, mut stored)) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                stored.redelivered = true;
                queue.ready.push_front(stored);
            }
        }
        channel.notifier.notify(reason);
        for name in self.queue_names() {
            self.dispatch(&name);
        }
        true
    }

    fn close_connection(&mut self, connection_id: u64, reason: &str) {
        if let Some(notifier) = self.connections.remove(&connection_id) {
            notifier.notify(reason);
        }
        let ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.close_channel(id, reason);
        }
    }
}

fn to_delivery(delivery_tag: u64, stored: &StoredMessage) -> Delivery {
    Delivery {
        delivery_tag,
        redelivered: stored.redelivered,
        content_type: stored.message.content_type.clone(),
        timestamp: Some(stored.message.timestamp_ms),
        headers: stored.message.headers.clone(),
        body: stored.message.body.clone(),
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    connects: AtomicUsize,
    unavailable: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker. Cloning shares the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every connect attempt, to widen race windows in tests.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self
            .shared
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    /// Makes subsequent connect attempts fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Closes every connection from the broker side.
    pub fn close_connections(&self, reason: &str) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, reason);
        }
    }

    /// Returns `true` if the queue exists.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Messages waiting in the queue, oldest first.
    #[must_use]
    pub fn ready_messages(&self, queue: &str) -> Vec<OutboundMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries awaiting acknowledgment across all channels.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .map(|ch| ch.unacked.len())
            .sum()
    }

    /// Number of open channels.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.shared.lock().channels.len()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .shared
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(
                "connection refused by memory broker".to_string(),
            ));
        }

        let notifier = Arc::new(CloseNotifier::new());
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id();
            state.connections.insert(id, Arc::clone(&notifier));
            id
        };
        Ok(Arc::new(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            notifier,
        }))
    }
}

/// Connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    notifier: Arc<CloseNotifier>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_confirm_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if self.notifier.is_closed() {
            return Err(BrokerError::Closed("connection is closed".to_string()));
        }
        let notifier = Arc::new(CloseNotifier::new());
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelState {
                    connection_id: self.id,
                    next_tag: 0,
                    prefetch: 0,
                    unacked: BTreeMap::new(),
                    notifier: Arc::clone(&notifier),
                },
            );
            id
        };
        Ok(Box::new(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
            notifier,
        }))
    }

    fn closed(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

/// Channel on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    notifier: Arc<CloseNotifier>,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BrokerError::Closed("channel is closed".to_string()))
        }
    }

    /// Fails the channel the way a broker does after a soft error.
    fn fail(&self, state: &mut BrokerState, reason: String) -> String {
        state.close_channel(self.id, &reason);
        reason
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn check_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if state.queues.contains_key(queue) {
            return Ok(());
        }
        let reason = self.fail(&mut state, format!("NOT_FOUND - no queue '{queue}'"));
        Err(BrokerError::NotFound(reason))
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.queues.remove(queue);
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm, BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        // Unroutable messages are dropped and still confirmed.
        if let Some(queue) = state.queues.get_mut(routing_key) {
            queue.ready.push_back(StoredMessage {
                message,
                redelivered: false,
            });
            state.dispatch(routing_key);
        }
        Ok(futures_util::future::ready(Ok(())).boxed())
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        for name in state.queue_names() {
            state.dispatch(&name);
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        let Some(stored) = state.queues.get_mut(queue).map(|q| q.ready.pop_front()) else {
            let reason = self.fail(&mut state, format!("NOT_FOUND - no queue '{queue}'"));
            return Err(BrokerError::NotFound(reason));
        };
        let Some(stored) = stored else {
            return Ok(None);
        };
        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Err(BrokerError::Closed("channel is closed".to_string()));
        };
        channel.next_tag = channel.next_tag.saturating_add(1);
        Ok(Some(to_delivery(channel.next_tag, &stored)))
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer, BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if !state.queues.contains_key(queue) {
            let reason = self.fail(&mut state, format!("NOT_FOUND - no queue '{queue}'"));
            return Err(BrokerError::NotFound(reason));
        }
        let tag = format!("amq.ctag-{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                channel_id: self.id,
                no_ack,
                tx,
            });
        }
        state.dispatch(queue);

        let deliveries = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        let known = state
            .channels
            .get(&self.id)
            .is_some_and(|ch| ch.unacked.contains_key(&delivery_tag));
        if !known {
            let reason = self.fail(
                &mut state,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            );
            return Err(BrokerError::Operation(reason));
        }
        if let Some(channel) = state.channels.get_mut(&self.id) {
            if multiple {
                let rest = channel.unacked.split_off(&delivery_tag.saturating_add(1));
                channel.unacked = rest;
            } else {
                channel.unacked.remove(&delivery_tag);
            }
        }
        for name in state.queue_names() {
            state.dispatch(&name);
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
            queue.cursor = 0;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if state.close_channel(self.id, "closed by client") {
            Ok(())
        } else {
            Err(BrokerError::Closed("channel is already closed".to_string()))
        }
    }

    fn closed(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}
