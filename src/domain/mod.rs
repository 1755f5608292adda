//! Domain layer: queue identity, request options and message types.
//!
//! Everything here is pure data and validation; no broker I/O happens in
//! this module.

pub mod message;
pub mod options;
pub mod scope;

pub use message::{DEFAULT_CONTENT_TYPE, Delivery, Headers, OutboundMessage};
pub use options::{Encoding, RequestOptions, Ttl};
pub use scope::Scope;
