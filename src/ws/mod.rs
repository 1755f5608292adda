//! WebSocket stream sessions.
//!
//! `GET /v2/{project}/queues/{queue}/messages` upgrades to one of two
//! sub-protocols, negotiated through `Sec-WebSocket-Protocol`:
//!
//! - `publish`: every completed packet is published with confirms, and
//!   each confirm is acknowledged to the client in publish order.
//! - `consume`: a consumer streams deliveries to the client, bounded by the
//!   prefetch limit; under lock semantics the client acks explicitly.
//!
//! A session owns its own broker channel. Whatever ends it (client close,
//! protocol violation, broker failure) goes through [`shutdown::Shutdown`].

pub mod consume;
pub mod handler;
pub mod messages;
pub mod publish;
pub mod shutdown;

use std::sync::Arc;

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::domain::{RequestOptions, Scope};

/// Sub-protocol selected at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Client publishes packets.
    Publish,
    /// Client receives deliveries.
    Consume,
}

impl SessionMode {
    /// Matches the exact sub-protocol name.
    #[must_use]
    pub fn from_protocol(protocol: &str) -> Option<Self> {
        match protocol {
            "publish" => Some(Self::Publish),
            "consume" => Some(Self::Consume),
            _ => None,
        }
    }

    /// Sub-protocol name echoed back to the client.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Consume => "consume",
        }
    }
}

/// Everything a session needs once the socket is upgraded.
#[derive(Debug)]
pub struct SessionContext {
    /// Queue the session publishes to or consumes from.
    pub scope: Scope,
    /// The session's own broker channel.
    pub channel: Box<dyn BrokerChannel>,
    /// Shared connection the channel lives on.
    pub connection: Arc<dyn BrokerConnection>,
    /// Validated query options.
    pub options: RequestOptions,
    /// Largest accepted client frame, in bytes.
    pub max_message_size: usize,
    /// Upper TTL bound for published packets.
    pub max_ttl_secs: u64,
    /// Prefetch used when the client gives no `limit`.
    pub default_limit: u16,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_protocol_names_match() {
        assert_eq!(SessionMode::from_protocol("publish"), Some(SessionMode::Publish));
        assert_eq!(SessionMode::from_protocol("consume"), Some(SessionMode::Consume));
        assert_eq!(SessionMode::from_protocol("Publish"), None);
        assert_eq!(SessionMode::from_protocol("publish, consume"), None);
    }
}
