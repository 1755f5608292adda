//! Stream framing: inbound frames, packet reassembly on the publish side,
//! client commands and delivery envelopes on the consume side.
//!
//! Both directions share one convention: a message travels as a JSON
//! envelope frame, optionally followed by a raw binary frame carrying the
//! body.

use std::fmt;

use axum::body::Bytes;
use axum::extract::ws::Message;
use serde_json::{Map, Value};

use crate::domain::options::expiration_ms;
use crate::domain::{Delivery, Encoding, Headers, OutboundMessage, Ttl};
use crate::error::GatewayError;

/// Envelope key carrying the message body.
const MESSAGE_KEY: &str = "message";
/// Envelope key carrying the content type.
const CONTENT_TYPE_KEY: &str = "Content-Type";

/// A data frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw frame payload.
    pub data: Bytes,
    /// Whether the frame was sent as binary.
    pub binary: bool,
}

impl Frame {
    /// Extracts the payload of a text or binary message. Control frames
    /// yield `None`.
    #[must_use]
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self {
                data: Bytes::copy_from_slice(text.as_str().as_bytes()),
                binary: false,
            }),
            Message::Binary(data) => Some(Self { data, binary: true }),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
        }
    }
}

/// Maps a failed socket read to the error reported to the client.
///
/// A frame over the socket's size limit is payload-too-large. Any other
/// read failure means the client is gone and nothing is reported.
#[must_use]
pub fn read_failure(err: &impl fmt::Display) -> Option<GatewayError> {
    let message = err.to_string();
    (message.contains("Space limit exceeded") || message.contains("Message too long"))
        .then(|| GatewayError::PayloadTooLarge("Message too large.".to_string()))
}

/// Frame sent to acknowledge a confirmed publish.
#[must_use]
pub fn confirm_frame() -> Message {
    Message::Binary(Bytes::new())
}

#[derive(Debug, Default)]
struct Packet {
    envelope: Map<String, Value>,
    message: Option<Bytes>,
}

/// Reassembles publish packets from client frames.
///
/// A binary frame with no packet open is a complete packet on its own. A
/// text frame opens a packet from its JSON envelope; when the envelope has
/// no `message`, the next frame supplies the body.
#[derive(Debug)]
pub struct PacketAssembler {
    pending: Option<Packet>,
    max_message_size: usize,
    max_ttl_secs: u64,
}

impl PacketAssembler {
    /// Creates an assembler with no packet open.
    #[must_use]
    pub fn new(max_message_size: usize, max_ttl_secs: u64) -> Self {
        Self {
            pending: None,
            max_message_size,
            max_ttl_secs,
        }
    }

    /// Returns `true` while an envelope waits for its body.
    #[must_use]
    pub fn is_packet_open(&self) -> bool {
        self.pending.is_some()
    }

    /// Feeds one frame. Returns the message to publish once a packet is
    /// complete.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::PayloadTooLarge`] for a frame over the size limit,
    ///   checked before anything is parsed.
    /// - [`GatewayError::InvalidContent`] for a text frame that is not a
    ///   JSON object, or an envelope with an invalid `ttl`.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<OutboundMessage>, GatewayError> {
        if frame.data.len() > self.max_message_size {
            return Err(GatewayError::PayloadTooLarge("Message too large.".to_string()));
        }

        let packet = match self.pending.take() {
            Some(mut packet) => {
                packet.message = Some(frame.data);
                packet
            }
            None if frame.binary => Packet {
                envelope: Map::new(),
                message: Some(frame.data),
            },
            None => open_packet(&frame.data)?,
        };

        let Packet { envelope, message } = packet;
        let Some(body) = message else {
            self.pending = Some(Packet {
                envelope,
                message: None,
            });
            return Ok(None);
        };
        self.build_message(&envelope, body).map(Some)
    }

    fn build_message(
        &self,
        envelope: &Map<String, Value>,
        body: Bytes,
    ) -> Result<OutboundMessage, GatewayError> {
        let ttl = match envelope.get("ttl") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                Ttl::from_json(value, self.max_ttl_secs)
                    .map_err(|err| GatewayError::InvalidContent(err_message(&err)))?,
            ),
        };
        let content_type = envelope
            .get(CONTENT_TYPE_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let headers: Headers = envelope
            .iter()
            .filter(|(key, _)| key.starts_with("x-"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(OutboundMessage::new(body, expiration_ms(ttl, self.max_ttl_secs))
            .with_content_type(content_type)
            .with_headers(headers))
    }
}

fn open_packet(data: &[u8]) -> Result<Packet, GatewayError> {
    let Ok(Value::Object(mut envelope)) = serde_json::from_slice::<Value>(data) else {
        return Err(GatewayError::InvalidContent(
            "Payload must be binary or a JSON object.".to_string(),
        ));
    };
    let message = envelope.remove(MESSAGE_KEY).map(|value| match value {
        Value::String(s) => Bytes::from(s),
        Value::Null => Bytes::new(),
        other => Bytes::from(other.to_string()),
    });
    Ok(Packet { envelope, message })
}

fn err_message(err: &GatewayError) -> String {
    match err {
        GatewayError::InvalidArgument(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// A command sent by a consuming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop delivery (empty frame).
    Cancel,
    /// Acknowledge a delivery, or everything up to it when `multiple`.
    Ack {
        /// Delivery tag from the envelope's `ackId`.
        delivery_tag: u64,
        /// Cumulative acknowledgment.
        multiple: bool,
    },
}

/// Parses a consume-side client frame.
///
/// `{"ackId": "<tag>"}` acknowledges one delivery and `{"ackToId": "<tag>"}`
/// acknowledges cumulatively. When both are present `ackId` wins.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidContent`] for anything but an empty frame
/// or an ack object, and for acks on a session without lock semantics.
pub fn parse_command(frame: &Frame, lock: bool) -> Result<Command, GatewayError> {
    if frame.data.is_empty() {
        return Ok(Command::Cancel);
    }
    let payload = if frame.binary {
        None
    } else {
        serde_json::from_slice::<Value>(&frame.data).ok()
    };
    let Some(Value::Object(payload)) = payload else {
        return Err(GatewayError::InvalidContent(
            "Payload must be a JSON object.".to_string(),
        ));
    };

    let (id, multiple) = match (
        payload.get("ackId").and_then(Value::as_str),
        payload.get("ackToId").and_then(Value::as_str),
    ) {
        (Some(id), _) => (id, false),
        (None, Some(id)) => (id, true),
        (None, None) => {
            return Err(GatewayError::InvalidContent(
                "Unrecognized command.".to_string(),
            ));
        }
    };
    if !lock {
        return Err(GatewayError::InvalidContent(
            "Acks can only be sent on connections without immediate acks.".to_string(),
        ));
    }
    let delivery_tag = id.trim().parse::<u64>().map_err(|_| {
        GatewayError::InvalidContent(format!("Invalid ack id: {id}"))
    })?;
    Ok(Command::Ack {
        delivery_tag,
        multiple,
    })
}

/// Renders a delivery as outbound frames.
///
/// With an `encoding` the body is embedded under `message` and a single
/// text frame is produced. Otherwise the envelope is followed by the raw
/// body as a binary frame. `ackId` is present only under lock semantics.
/// Message headers are written after the standard fields and replace any
/// field of the same name.
#[must_use]
pub fn delivery_frames(delivery: &Delivery, lock: bool, encoding: Option<Encoding>) -> Vec<Message> {
    let mut envelope = Map::new();
    envelope.insert(
        CONTENT_TYPE_KEY.to_string(),
        Value::from(delivery.content_type_or_default()),
    );
    if let Some(timestamp) = delivery.timestamp {
        envelope.insert("timestamp".to_string(), Value::from(timestamp));
    }
    envelope.insert("redelivered".to_string(), Value::from(delivery.redelivered));
    if lock {
        envelope.insert(
            "ackId".to_string(),
            Value::from(delivery.delivery_tag.to_string()),
        );
    }
    envelope.extend(
        delivery
            .headers
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    match encoding {
        Some(encoding) => {
            envelope.insert(
                MESSAGE_KEY.to_string(),
                Value::from(encoding.encode(&delivery.body)),
            );
            vec![Message::text(Value::Object(envelope).to_string())]
        }
        None => vec![
            Message::text(Value::Object(envelope).to_string()),
            Message::Binary(delivery.body.clone()),
        ],
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn text(s: &str) -> Frame {
        Frame {
            data: Bytes::copy_from_slice(s.as_bytes()),
            binary: false,
        }
    }

    fn binary(data: &'static [u8]) -> Frame {
        Frame {
            data: Bytes::from_static(data),
            binary: true,
        }
    }

    fn delivery(tag: u64) -> Delivery {
        let mut headers = Headers::new();
        headers.insert("x-foo".to_string(), serde_json::json!("bar"));
        Delivery {
            delivery_tag: tag,
            redelivered: false,
            content_type: Some("text/plain".to_string()),
            timestamp: Some(1_700_000_000_000),
            headers,
            body: Bytes::from_static(b"hello"),
        }
    }

    fn envelope(message: &Message) -> Map<String, Value> {
        let Message::Text(text) = message else {
            panic!("expected a text frame");
        };
        let Ok(Value::Object(map)) = serde_json::from_str(text.as_str()) else {
            panic!("envelope is not a JSON object");
        };
        map
    }

    #[test]
    fn envelope_then_binary_makes_one_message() {
        let mut assembler = PacketAssembler::new(1024, 3600);
        let Ok(None) = assembler.accept(text(r#"{"Content-Type":"text/plain","x-foo":"bar"}"#))
        else {
            panic!("envelope alone must not publish");
        };
        assert!(assembler.is_packet_open());

        let Ok(Some(message)) = assembler.accept(binary(b"hello")) else {
            panic!("body frame must complete the packet");
        };
        assert!(!assembler.is_packet_open());
        assert_eq!(message.body, Bytes::from_static(b"hello"));
        assert_eq!(message.content_type.as_deref(), Some("text/plain"));
        assert_eq!(message.headers.get("x-foo"), Some(&serde_json::json!("bar")));
        assert_eq!(message.expiration_ms, 3_600_000);
    }

    #[test]
    fn lone_binary_frame_is_a_packet() {
        let mut assembler = PacketAssembler::new(1024, 3600);
        let Ok(Some(message)) = assembler.accept(binary(b"raw")) else {
            panic!("binary frame must publish");
        };
        assert_eq!(message.body, Bytes::from_static(b"raw"));
        assert!(message.content_type.is_none());
    }

    #[test]
    fn inline_message_and_ttl() {
        let mut assembler = PacketAssembler::new(1024, 3600);
        let Ok(Some(message)) = assembler.accept(text(r#"{"message":"hi","ttl":2}"#)) else {
            panic!("inline message must publish");
        };
        assert_eq!(message.body, Bytes::from_static(b"hi"));
        assert_eq!(message.expiration_ms, 2000);
    }

    #[test]
    fn text_frame_overwrites_open_packet_body() {
        let mut assembler = PacketAssembler::new(1024, 3600);
        assert!(matches!(assembler.accept(text(r#"{"x-a":1}"#)), Ok(None)));
        let Ok(Some(message)) = assembler.accept(text("not json")) else {
            panic!("second frame must complete the packet");
        };
        assert_eq!(message.body, Bytes::from_static(b"not json"));
        assert_eq!(message.headers.get("x-a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn oversized_frame_is_rejected_first() {
        let mut assembler = PacketAssembler::new(4, 3600);
        assert!(matches!(
            assembler.accept(text("{ not even json }")),
            Err(GatewayError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn malformed_envelope_is_invalid_content() {
        let mut assembler = PacketAssembler::new(1024, 3600);
        assert!(matches!(
            assembler.accept(text("[1,2]")),
            Err(GatewayError::InvalidContent(_))
        ));
        assert!(matches!(
            assembler.accept(text(r#"{"message":"x","ttl":-1}"#)),
            Err(GatewayError::InvalidContent(_))
        ));
    }

    #[test]
    fn socket_capacity_errors_are_payload_too_large() {
        let too_long = "Space limit exceeded: Message too long: 70000 > 2048";
        assert!(matches!(
            read_failure(&too_long),
            Some(GatewayError::PayloadTooLarge(ref m)) if m == "Message too large."
        ));
        assert!(read_failure(&"IO error: Connection reset by peer (os error 104)").is_none());
    }

    #[test]
    fn empty_frame_cancels() {
        assert!(matches!(parse_command(&text(""), false), Ok(Command::Cancel)));
        assert!(matches!(parse_command(&binary(b""), true), Ok(Command::Cancel)));
    }

    #[test]
    fn ack_commands_require_lock() {
        let frame = text(r#"{"ackId":"3"}"#);
        let Ok(Command::Ack {
            delivery_tag,
            multiple,
        }) = parse_command(&frame, true)
        else {
            panic!("ackId must parse");
        };
        assert_eq!(delivery_tag, 3);
        assert!(!multiple);

        assert!(matches!(
            parse_command(&text(r#"{"ackToId":"5"}"#), true),
            Ok(Command::Ack {
                delivery_tag: 5,
                multiple: true
            })
        ));
        assert!(matches!(
            parse_command(&frame, false),
            Err(GatewayError::InvalidContent(_))
        ));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(matches!(
            parse_command(&text(r#"{"hello":"world"}"#), true),
            Err(GatewayError::InvalidContent(ref m)) if m == "Unrecognized command."
        ));
        assert!(matches!(
            parse_command(&binary(b"\x01"), true),
            Err(GatewayError::InvalidContent(ref m)) if m == "Payload must be a JSON object."
        ));
        assert!(matches!(
            parse_command(&text(r#"{"ackId":"abc"}"#), true),
            Err(GatewayError::InvalidContent(_))
        ));
    }

    #[test]
    fn raw_mode_sends_envelope_then_body() {
        let frames = delivery_frames(&delivery(7), true, None);
        assert_eq!(frames.len(), 2);
        let map = envelope(&frames[0]);
        assert_eq!(map["ackId"], "7");
        assert_eq!(map["Content-Type"], "text/plain");
        assert_eq!(map["x-foo"], "bar");
        assert_eq!(map["redelivered"], false);
        assert!(!map.contains_key("message"));
        assert_eq!(frames[1], Message::Binary(Bytes::from_static(b"hello")));
    }

    #[test]
    fn encoded_mode_embeds_body() {
        let frames = delivery_frames(&delivery(7), false, Some(Encoding::Base64));
        assert_eq!(frames.len(), 1);
        let map = envelope(&frames[0]);
        assert_eq!(map["message"], "aGVsbG8=");
        assert!(!map.contains_key("ackId"));

        let frames = delivery_frames(&delivery(7), false, Some(Encoding::Utf8));
        assert_eq!(envelope(&frames[0])["message"], "hello");
    }

    #[test]
    fn message_headers_are_written_last() {
        let mut d = delivery(1);
        d.headers
            .insert("Content-Type".to_string(), serde_json::json!("application/json"));
        d.headers
            .insert("redelivered".to_string(), serde_json::json!("maybe"));
        let map = envelope(&delivery_frames(&d, true, None)[0]);
        assert_eq!(map["Content-Type"], "application/json");
        assert_eq!(map["redelivered"], "maybe");
        assert_eq!(map["ackId"], "1");
    }
}
