//! REST surface against a live server.

#![allow(clippy::panic)]

mod common;

use reqwest::StatusCode;

use common::{config, create_queue, spawn};

#[tokio::test]
async fn create_is_idempotent_and_delete_reports_missing() {
    let server = spawn(config()).await;
    let client = reqwest::Client::new();

    create_queue(&server, "acme", "jobs").await;
    create_queue(&server, "acme", "jobs").await;
    assert!(server.broker.has_queue("acme_jobs"));

    let Ok(response) = client
        .delete(server.http("/v2/acme/queues/jobs"))
        .send()
        .await
    else {
        panic!("delete request failed");
    };
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!server.broker.has_queue("acme_jobs"));

    let Ok(response) = client
        .delete(server.http("/v2/acme/queues/jobs"))
        .send()
        .await
    else {
        panic!("delete request failed");
    };
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn published_message_comes_back_with_metadata() {
    let server = spawn(config()).await;
    let client = reqwest::Client::new();
    create_queue(&server, "acme", "jobs").await;

    let Ok(response) = client
        .post(server.http("/v2/acme/queues/jobs/messages?ttl=30"))
        .header("Content-Type", "text/plain")
        .header("x-msg-x-trace", "abc")
        .header("x-other", "dropped")
        .body("hello")
        .send()
        .await
    else {
        panic!("publish request failed");
    };
    assert_eq!(response.status(), StatusCode::CREATED);

    let stored = server.broker.ready_messages("acme_jobs");
    let Some(message) = stored.first() else {
        panic!("message was not stored");
    };
    assert_eq!(message.expiration_ms, 30_000);
    assert!(message.persistent);

    let Ok(response) = client
        .delete(server.http("/v2/acme/queues/jobs/messages"))
        .send()
        .await
    else {
        panic!("fetch request failed");
    };
    assert_eq!(response.status(), StatusCode::OK);
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    assert_eq!(header("content-type").as_deref(), Some("text/plain"));
    assert_eq!(header("x-msg-x-trace").as_deref(), Some("abc"));
    assert_eq!(header("x-msg-redelivered").as_deref(), Some("false"));
    assert!(header("x-msg-timestamp").is_some());
    assert!(header("x-other").is_none());
    let Ok(body) = response.text().await else {
        panic!("body unreadable");
    };
    assert_eq!(body, "hello");
}

#[tokio::test]
async fn fetch_from_empty_queue_is_no_content() {
    let server = spawn(config()).await;
    create_queue(&server, "acme", "jobs").await;

    let Ok(response) = reqwest::Client::new()
        .delete(server.http("/v2/acme/queues/jobs/messages"))
        .send()
        .await
    else {
        panic!("fetch request failed");
    };
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn message_routes_require_existing_queue() {
    let server = spawn(config()).await;
    let client = reqwest::Client::new();

    let Ok(response) = client
        .post(server.http("/v2/acme/queues/missing/messages"))
        .body("hello")
        .send()
        .await
    else {
        panic!("publish request failed");
    };
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let Ok(response) = client
        .delete(server.http("/v2/acme/queues/missing/messages"))
        .send()
        .await
    else {
        panic!("fetch request failed");
    };
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!server.broker.has_queue("acme_missing"));
}

#[tokio::test]
async fn invalid_parameters_are_rejected_before_the_broker() {
    let server = spawn(config()).await;
    let client = reqwest::Client::new();

    for path in [
        "/v2/acme/queues/jobs?ttl=-1",
        "/v2/acme/queues/jobs?ttl=3601",
        "/v2/acme/queues/jobs?ttl=soon",
        "/v2/acme/queues/jobs?limit=0",
        "/v2/acme/queues/jobs?encoding=utf16",
        "/v2/ac-me/queues/jobs",
        "/v2/acme/queues/jo%20bs",
    ] {
        let Ok(response) = client.put(server.http(path)).send().await else {
            panic!("request failed");
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
    }
    assert_eq!(server.broker.connect_count(), 0);

    let Ok(response) = client
        .put(server.http("/v2/acme/queues/jobs?ttl=0"))
        .send()
        .await
    else {
        panic!("request failed");
    };
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn error_body_is_structured() {
    let server = spawn(config()).await;
    let Ok(response) = reqwest::Client::new()
        .put(server.http("/v2/acme/queues/jobs?ttl=-1"))
        .send()
        .await
    else {
        panic!("request failed");
    };
    let Ok(body) = response.json::<serde_json::Value>().await else {
        panic!("error body must be JSON");
    };
    assert_eq!(body["error"]["code"], 1001);
    let Some(message) = body["error"]["message"].as_str() else {
        panic!("message must be a string");
    };
    assert!(message.contains("TTL must be in seconds and between 0 and 3600"));
}

#[tokio::test]
async fn oversized_body_is_too_large() {
    let server = spawn(config()).await;
    create_queue(&server, "acme", "jobs").await;

    let Ok(response) = reqwest::Client::new()
        .post(server.http("/v2/acme/queues/jobs/messages"))
        .body(vec![b'x'; 4096])
        .send()
        .await
    else {
        panic!("publish request failed");
    };
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(server.broker.ready_messages("acme_jobs").is_empty());
}

#[tokio::test]
async fn unavailable_broker_is_service_unavailable() {
    let server = spawn(config()).await;
    server.broker.set_unavailable(true);

    let Ok(response) = reqwest::Client::new()
        .put(server.http("/v2/acme/queues/jobs"))
        .send()
        .await
    else {
        panic!("request failed");
    };
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    server.broker.set_unavailable(false);
    create_queue(&server, "acme", "jobs").await;
}

#[tokio::test]
async fn request_channels_are_released() {
    let server = spawn(config()).await;
    create_queue(&server, "acme", "jobs").await;
    let Ok(_) = reqwest::Client::new()
        .delete(server.http("/v2/acme/queues/missing"))
        .send()
        .await
    else {
        panic!("request failed");
    };
    for _ in 0..50 {
        if server.broker.open_channels() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(server.broker.open_channels(), 0);
    assert_eq!(server.broker.connect_count(), 1);
}

#[tokio::test]
async fn health_reports_status() {
    let server = spawn(config()).await;
    let Ok(response) = reqwest::get(server.http("/health")).await else {
        panic!("health request failed");
    };
    assert_eq!(response.status(), StatusCode::OK);
    let Ok(body) = response.json::<serde_json::Value>().await else {
        panic!("health body must be JSON");
    };
    assert_eq!(body["status"], "healthy");
}
