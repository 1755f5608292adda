//! OpenAPI document for the REST surface.

use utoipa::OpenApi;

use crate::api::handlers::{message, queue, system};
use crate::error::{ErrorBody, ErrorResponse};

/// Generated OpenAPI description, served by Swagger UI when the
/// `swagger-ui` feature is enabled.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "queue-gateway",
        description = "HTTP and WebSocket front end for an AMQP message broker."
    ),
    paths(
        queue::create_queue,
        queue::delete_queue,
        message::publish_message,
        message::take_message,
        system::health_handler,
    ),
    components(schemas(ErrorResponse, ErrorBody, system::HealthResponse)),
    tags(
        (name = "Queues", description = "Queue lifecycle"),
        (name = "Messages", description = "Publishing and fetching messages"),
        (name = "System", description = "Service status"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_queue_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/v2/{project}/queues/{queue}"));
        assert!(
            doc.paths
                .paths
                .contains_key("/v2/{project}/queues/{queue}/messages")
        );
        assert!(doc.paths.paths.contains_key("/health"));
    }
}
