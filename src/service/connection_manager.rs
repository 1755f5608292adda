//! Per-identity broker connection cache with single-flight connects.
//!
//! [`ConnectionManager`] owns the gateway's only cross-request mutable
//! state: which identity has a live connection, and which identities have
//! a connect attempt in flight together with the requests waiting on it.
//! Both live in one map behind one lock, so "first caller becomes the
//! initiator, everyone else enqueues" is a single check-and-insert.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

use crate::broker::{BrokerClient, BrokerConnection};
use crate::error::GatewayError;

/// Authenticated client key. Owns at most one live broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Creates an identity from an opaque key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The fixed identity used while the gateway has no authentication.
    #[must_use]
    pub fn guest() -> Self {
        Self::new("guest")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Waiter = oneshot::Sender<Result<Arc<dyn BrokerConnection>, GatewayError>>;

#[derive(Debug)]
enum Slot {
    /// Connected; shared by every request of the identity.
    Live(Arc<dyn BrokerConnection>),
    /// Connect attempt in flight; requests waiting for its outcome.
    Connecting(Vec<Waiter>),
}

/// Lazily connects one broker connection per [`Identity`] and evicts it when
/// the broker closes it.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    broker: Arc<dyn BrokerClient>,
    slots: Arc<Mutex<HashMap<Identity, Slot>>>,
}

impl ConnectionManager {
    /// Creates a manager with no connections.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the identity's connection, connecting first if needed.
    ///
    /// Concurrent callers for an identity without a connection share a
    /// single connect attempt and all observe its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BrokerUnavailable`] if the connect attempt
    /// this caller waited on failed. The failure is not retried; the next
    /// request starts a fresh attempt.
    pub async fn acquire(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn BrokerConnection>, GatewayError> {
        let outcome = {
            let mut slots = self.slots.lock().await;
            let (tx, rx) = oneshot::channel();
            match slots.get_mut(identity) {
                Some(Slot::Live(connection)) => return Ok(Arc::clone(connection)),
                Some(Slot::Connecting(waiters)) => {
                    tracing::debug!(%identity, queued = waiters.len() + 1, "awaiting pending connect");
                    waiters.push(tx);
                }
                None => {
                    slots.insert(identity.clone(), Slot::Connecting(vec![tx]));
                    self.spawn_connect(identity.clone());
                }
            }
            rx
        };

        outcome.await.map_err(|_| {
            GatewayError::BrokerUnavailable("connect attempt was abandoned".to_string())
        })?
    }

    /// Returns `true` if the identity currently has a live connection.
    pub async fn is_connected(&self, identity: &Identity) -> bool {
        matches!(self.slots.lock().await.get(identity), Some(Slot::Live(_)))
    }

    /// Number of identities with a live connection.
    pub async fn live_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Runs the connect attempt on its own task so it completes even if the
    /// initiating request goes away.
    fn spawn_connect(&self, identity: Identity) {
        let manager = self.clone();
        tokio::spawn(async move { manager.connect(identity).await });
    }

    async fn connect(&self, identity: Identity) {
        tracing::info!(%identity, "connecting to broker");
        let result = self.broker.connect().await;

        let mut slots = self.slots.lock().await;
        let waiters = match slots.remove(&identity) {
            Some(Slot::Connecting(waiters)) => waiters,
            Some(live @ Slot::Live(_)) => {
                slots.insert(identity.clone(), live);
                Vec::new()
            }
            None => Vec::new(),
        };

        match result {
            Ok(connection) => {
                slots.insert(identity.clone(), Slot::Live(Arc::clone(&connection)));
                drop(slots);
                tracing::info!(%identity, waiters = waiters.len(), "broker connection established");
                self.watch(identity, Arc::clone(&connection));
                for waiter in waiters {
                    let _ = waiter.send(Ok(Arc::clone(&connection)));
                }
            }
            Err(err) => {
                drop(slots);
                tracing::error!(%identity, error = %err, waiters = waiters.len(), "broker connect failed");
                let failure =
                    GatewayError::BrokerUnavailable("Cannot connect to the AMQP backend.".to_string());
                for waiter in waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
        }
    }

    /// Evicts the connection once the broker closes it or it errors.
    fn watch(&self, identity: Identity, connection: Arc<dyn BrokerConnection>) {
        let slots = Arc::clone(&self.slots);
        let mut closed = connection.closed();
        tokio::spawn(async move {
            let reason = closed.wait().await;
            let mut slots = slots.lock().await;
            if let Some(Slot::Live(live)) = slots.get(&identity)
                && Arc::ptr_eq(live, &connection)
            {
                slots.remove(&identity);
                tracing::warn!(%identity, %reason, "broker connection lost; evicted");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::MemoryBroker;

    fn manager(broker: &MemoryBroker) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn reuses_live_connection() {
        let broker = MemoryBroker::new();
        let connections = manager(&broker);
        let identity = Identity::guest();

        let Ok(first) = connections.acquire(&identity).await else {
            panic!("acquire failed");
        };
        let Ok(second) = connections.acquire(&identity).await else {
            panic!("acquire failed");
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_one_connect() {
        let broker = MemoryBroker::new().with_connect_delay(Duration::from_millis(50));
        let connections = manager(&broker);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let connections = connections.clone();
            handles.push(tokio::spawn(async move {
                connections.acquire(&Identity::guest()).await
            }));
        }

        let mut resolved = Vec::new();
        for handle in handles {
            let Ok(Ok(connection)) = handle.await else {
                panic!("waiter not resolved with a connection");
            };
            resolved.push(connection);
        }
        assert_eq!(resolved.len(), 8);
        assert_eq!(broker.connect_count(), 1);
        assert!(resolved.windows(2).all(|w| match w {
            [a, b] => Arc::ptr_eq(a, b),
            _ => false,
        }));
    }

    #[tokio::test]
    async fn waiter_stays_pending_until_connect_completes() {
        let broker = MemoryBroker::new().with_connect_delay(Duration::from_millis(100));
        let connections = manager(&broker);

        let mut waiter = tokio_test::task::spawn({
            let connections = connections.clone();
            async move { connections.acquire(&Identity::guest()).await.is_ok() }
        });
        tokio_test::assert_pending!(waiter.poll());

        let Ok(_) = connections.acquire(&Identity::guest()).await else {
            panic!("acquire failed");
        };
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), true);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn failed_connect_fails_every_waiter_then_retries() {
        let broker = MemoryBroker::new().with_connect_delay(Duration::from_millis(20));
        broker.set_unavailable(true);
        let connections = manager(&broker);

        let a = tokio::spawn({
            let connections = connections.clone();
            async move { connections.acquire(&Identity::guest()).await }
        });
        let b = tokio::spawn({
            let connections = connections.clone();
            async move { connections.acquire(&Identity::guest()).await }
        });
        for handle in [a, b] {
            let Ok(result) = handle.await else {
                panic!("task panicked");
            };
            assert!(matches!(result, Err(GatewayError::BrokerUnavailable(_))));
        }
        assert_eq!(broker.connect_count(), 1);

        broker.set_unavailable(false);
        assert!(connections.acquire(&Identity::guest()).await.is_ok());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn broker_close_evicts_connection() {
        let broker = MemoryBroker::new();
        let connections = manager(&broker);
        let identity = Identity::guest();

        let Ok(first) = connections.acquire(&identity).await else {
            panic!("acquire failed");
        };
        assert!(connections.is_connected(&identity).await);

        broker.close_connections("broker restart");
        for _ in 0..50 {
            if !connections.is_connected(&identity).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(connections.live_count().await, 0);

        let Ok(second) = connections.acquire(&identity).await else {
            panic!("reacquire failed");
        };
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn identities_get_separate_connections() {
        let broker = MemoryBroker::new();
        let connections = manager(&broker);
        let _ = connections.acquire(&Identity::new("alice")).await;
        let _ = connections.acquire(&Identity::new("bob")).await;
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(connections.live_count().await, 2);
    }
}
