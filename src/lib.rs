//! # queue-gateway
//!
//! HTTP and WebSocket gateway exposing message-queue semantics on top of an
//! AMQP broker.
//!
//! Clients create and delete queues, publish and fetch single messages over
//! REST, and open long-lived publish or consume streams over WebSocket. The
//! broker does the queueing; this service validates requests, shares one
//! broker connection per identity and gives every request its own channel.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)
//!     ├── Stream Sessions (ws/)
//!     │
//!     ├── QueueContext: scope + options validation
//!     ├── ConnectionManager / RequestChannel (service/)
//!     │
//!     └── BrokerClient (broker/): lapin or in-memory
//! ```

pub mod api;
pub mod app_state;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod ws;
