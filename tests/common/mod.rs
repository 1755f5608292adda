//! Shared harness: a real server on an ephemeral port, backed by the
//! in-memory broker.

#![allow(dead_code, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;

use queue_gateway::api;
use queue_gateway::app_state::AppState;
use queue_gateway::broker::MemoryBroker;
use queue_gateway::config::GatewayConfig;

/// A running gateway.
pub struct TestServer {
    pub addr: SocketAddr,
    pub broker: MemoryBroker,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }
}

pub fn config() -> GatewayConfig {
    GatewayConfig {
        max_message_size: 1024,
        ..GatewayConfig::default()
    }
}

pub async fn spawn(config: GatewayConfig) -> TestServer {
    let broker = MemoryBroker::new();
    let app = api::build_app(AppState::new(Arc::new(broker.clone()), config));
    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local address");
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestServer { addr, broker }
}

/// Creates `/v2/{project}/queues/{queue}` and asserts success.
pub async fn create_queue(server: &TestServer, project: &str, queue: &str) {
    let Ok(response) = reqwest::Client::new()
        .put(server.http(&format!("/v2/{project}/queues/{queue}")))
        .send()
        .await
    else {
        panic!("create request failed");
    };
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
}
