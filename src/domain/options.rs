//! Validated per-request options: TTL, prefetch limit, lock mode and body
//! encoding.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::GatewayError;

/// Message time-to-live in seconds, bounded by the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ttl(f64);

impl Ttl {
    /// Parses a TTL given as a decimal string of seconds. A blank value is
    /// zero, which expires after the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] if the value is not a finite
    /// number within `[0, max_ttl_secs]`.
    pub fn parse(raw: &str, max_ttl_secs: u64) -> Result<Self, GatewayError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self(0.0));
        }
        raw.parse::<f64>()
            .ok()
            .and_then(|secs| Self::bounded(secs, max_ttl_secs))
            .ok_or_else(|| ttl_error(max_ttl_secs))
    }

    /// Reads a TTL from a JSON envelope field, accepting numbers and
    /// numeric strings.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] on any other shape or an
    /// out-of-range value.
    pub fn from_json(value: &serde_json::Value, max_ttl_secs: u64) -> Result<Self, GatewayError> {
        match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .and_then(|secs| Self::bounded(secs, max_ttl_secs))
                .ok_or_else(|| ttl_error(max_ttl_secs)),
            serde_json::Value::String(s) => Self::parse(s, max_ttl_secs),
            _ => Err(ttl_error(max_ttl_secs)),
        }
    }

    fn bounded(secs: f64, max_ttl_secs: u64) -> Option<Self> {
        #[allow(clippy::cast_precision_loss)]
        let max = max_ttl_secs as f64;
        (secs.is_finite() && (0.0..=max).contains(&secs)).then_some(Self(secs))
    }

    /// Returns the TTL in seconds.
    #[must_use]
    pub const fn as_secs(self) -> f64 {
        self.0
    }
}

/// Broker expiration in milliseconds. A missing or zero TTL falls back to
/// the configured maximum.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn expiration_ms(ttl: Option<Ttl>, max_ttl_secs: u64) -> u64 {
    match ttl {
        Some(Ttl(secs)) if secs > 0.0 => (secs * 1000.0).round() as u64,
        _ => max_ttl_secs.saturating_mul(1000),
    }
}

fn ttl_error(max_ttl_secs: u64) -> GatewayError {
    GatewayError::InvalidArgument(format!(
        "TTL must be in seconds and between 0 and {max_ttl_secs}"
    ))
}

/// Parses the prefetch `limit` parameter.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidArgument`] unless the value is an integer
/// in `1..=65535`.
pub fn parse_limit(raw: &str) -> Result<u16, GatewayError> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|limit| *limit >= 1)
        .ok_or_else(|| GatewayError::InvalidArgument("Limit must be greater than 0.".to_string()))
}

/// Text encoding for message bodies embedded in a consume envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8, with invalid sequences replaced.
    Utf8,
    /// Standard base64 with padding.
    Base64,
}

impl Encoding {
    /// Parses an encoding name (`utf8`, `utf-8`, `base64`).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] for unknown names.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        match raw.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "base64" => Ok(Self::Base64),
            other => Err(GatewayError::InvalidArgument(format!(
                "Unsupported encoding: {other}"
            ))),
        }
    }

    /// Renders raw bytes as a string in this encoding.
    #[must_use]
    pub fn encode(self, body: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(body).into_owned(),
            Self::Base64 => BASE64.encode(body),
        }
    }
}

/// Options shared by every route, validated before any broker work.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestOptions {
    /// Message TTL for single publishes.
    pub ttl: Option<Ttl>,
    /// Explicit prefetch bound for consume sessions.
    pub limit: Option<u16>,
    /// Consume with explicit client acknowledgments.
    pub lock: bool,
    /// Embed consumed bodies in the JSON envelope using this encoding.
    pub encoding: Option<Encoding>,
}
