//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::broker::BrokerClient;
use crate::config::GatewayConfig;
use crate::service::{ConnectionManager, QueueOps};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Per-identity broker connections.
    pub connections: ConnectionManager,
    /// Single-shot queue operations.
    pub queues: QueueOps,
    /// Gateway limits and defaults.
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Builds the state around a broker client.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, config: GatewayConfig) -> Self {
        Self {
            connections: ConnectionManager::new(broker),
            queues: QueueOps,
            config: Arc::new(config),
        }
    }
}
