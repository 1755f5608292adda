//! Data Transfer Objects for path and query parameters.

pub mod queue_dto;

pub use queue_dto::*;
