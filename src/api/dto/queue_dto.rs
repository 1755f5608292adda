//! Path and query parameters shared by the queue routes.

use serde::Deserialize;
use utoipa::IntoParams;

use crate::domain::options::{Encoding, RequestOptions, Ttl, parse_limit};
use crate::error::GatewayError;

/// `/v2/{project}/queues/{queue}` path segments.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
pub struct QueuePath {
    /// Alphanumeric project identifier.
    pub project: String,
    /// Queue name, `[A-Za-z0-9.:_-]+`.
    pub queue: String,
}

/// Raw query parameters. Kept as strings so validation can report the
/// gateway's own error messages.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct QueueQuery {
    /// Message TTL in seconds, `0..=MAX_MESSAGE_TTL`.
    pub ttl: Option<String>,
    /// Prefetch bound for consume sessions, at least 1.
    pub limit: Option<String>,
    /// Present (with any value) to require explicit acks when consuming.
    pub lock: Option<String>,
    /// `utf8` or `base64`: embed consumed bodies in the JSON envelope.
    pub encoding: Option<String>,
}

impl QueueQuery {
    /// Validates the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidArgument`] naming the first invalid
    /// parameter.
    pub fn validate(&self, max_ttl_secs: u64) -> Result<RequestOptions, GatewayError> {
        Ok(RequestOptions {
            ttl: self
                .ttl
                .as_deref()
                .map(|raw| Ttl::parse(raw, max_ttl_secs))
                .transpose()?,
            limit: self.limit.as_deref().map(parse_limit).transpose()?,
            lock: self.lock.is_some(),
            encoding: self.encoding.as_deref().map(Encoding::parse).transpose()?,
        })
    }
}
