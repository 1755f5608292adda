//! Broker-neutral message types.
//!
//! [`OutboundMessage`] is what the gateway hands to a broker channel for
//! publishing; [`Delivery`] is what comes back from `get` or a consumer.

use std::collections::BTreeMap;

use axum::body::Bytes;
use chrono::Utc;

/// Content type reported for messages published without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Custom message headers, copied verbatim between clients and the broker.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// A message about to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Raw message content.
    pub body: Bytes,
    /// MIME type, when the client supplied one.
    pub content_type: Option<String>,
    /// Per-message expiration in milliseconds.
    pub expiration_ms: u64,
    /// Publish time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Whether the broker should persist the message to disk.
    pub persistent: bool,
    /// Custom headers.
    pub headers: Headers,
}

impl OutboundMessage {
    /// Creates a persistent message stamped with the current time.
    #[must_use]
    pub fn new(body: Bytes, expiration_ms: u64) -> Self {
        Self {
            body,
            content_type: None,
            expiration_ms,
            timestamp_ms: u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default(),
            persistent: true,
            headers: Headers::new(),
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Replaces the custom headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped delivery tag, the ack token for this message.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// MIME type as published.
    pub content_type: Option<String>,
    /// Publish timestamp as published.
    pub timestamp: Option<u64>,
    /// Custom headers.
    pub headers: Headers,
    /// Raw message content.
    pub body: Bytes,
}

impl Delivery {
    /// Returns the content type, defaulting to `application/octet-stream`.
    #[must_use]
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// Renders a header value as plain text: strings verbatim, everything else
/// as compact JSON.
#[must_use]
pub fn header_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_persistent_and_stamped() {
        let msg = OutboundMessage::new(Bytes::from_static(b"hi"), 1000);
        assert!(msg.persistent);
        assert!(msg.timestamp_ms > 0);
        assert!(msg.content_type.is_none());
        assert!(msg.headers.is_empty());
    }

    #[test]
    fn delivery_defaults_content_type() {
        let delivery = Delivery {
            delivery_tag: 1,
            redelivered: false,
            content_type: None,
            timestamp: None,
            headers: Headers::new(),
            body: Bytes::new(),
        };
        assert_eq!(delivery.content_type_or_default(), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn header_text_keeps_strings_verbatim() {
        assert_eq!(header_text(&serde_json::json!("bar")), "bar");
        assert_eq!(header_text(&serde_json::json!(7)), "7");
        assert_eq!(header_text(&serde_json::json!(true)), "true");
    }
}
