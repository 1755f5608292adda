//! REST endpoint handlers organized by resource.

pub mod message;
pub mod queue;
pub mod system;

use axum::Router;

use crate::app_state::AppState;

/// Composes all queue and message routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(queue::routes())
        .merge(message::routes())
}
