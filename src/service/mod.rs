//! Service layer: broker connection and channel lifecycle, queue operations.
//!
//! [`ConnectionManager`] hands out shared per-identity connections,
//! [`RequestChannel`] scopes one channel to one request, and [`QueueOps`]
//! runs the single-shot queue operations on that channel.

pub mod channel;
pub mod connection_manager;
pub mod queue_ops;

pub use channel::RequestChannel;
pub use connection_manager::{ConnectionManager, Identity};
pub use queue_ops::QueueOps;
