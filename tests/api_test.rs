mod common;

use axum::http::{Method, StatusCode};
use common::spawn_app;
use serde_json::json;

#[tokio::test]
async fn test_health_endpoints_are_public() {
    let app = spawn_app().await;

    let (status, body) = app.json(Method::GET, "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.json(Method::GET, "/api/health/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], "ok");
    assert_eq!(body["storage"], "ok");
    assert_eq!(body["providers"]["openai"], "closed");
}

#[tokio::test]
async fn test_provider_catalogue() {
    let app = spawn_app().await;

    let (status, body) = app.json(Method::GET, "/api/providers", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let providers = body.as_array().unwrap();
    assert!(providers.len() >= 8);
    let openai = providers.iter().find(|p| p["id"] == "openai").unwrap();
    assert!(openai["default_model"].is_string());
    assert!(openai.get("env_key").is_none());
}

#[tokio::test]
async fn test_api_keys_are_masked_and_scoped() {
    let app = spawn_app().await;
    let (alice, _) = app.register("alice@example.com").await;
    let (bob, _) = app.register("bob@example.com").await;

    let secret = "sk-abcdefghijklmnopqrstuvwxyz";
    let (status, body) = app
        .json(Method::PUT, "/api/keys/openai", Some(&alice), Some(json!({ "api_key": secret })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "openai");
    assert_eq!(body["masked_key"], "sk-a…wxyz");

    let (_, list) = app.json(Method::GET, "/api/keys", Some(&alice), None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert!(!list.to_string().contains(secret));

    let (_, list) = app.json(Method::GET, "/api/keys", Some(&bob), None).await;
    assert!(list.as_array().unwrap().is_empty());

    let (status, _) = app
        .json(Method::PUT, "/api/keys/nope", Some(&alice), Some(json!({ "api_key": secret })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app
        .json(Method::PUT, "/api/keys/groq", Some(&alice), Some(json!({ "api_key": "  " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.json(Method::DELETE, "/api/keys/openai", Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.json(Method::DELETE, "/api/keys/openai", Some(&alice), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, list) = app.json(Method::GET, "/api/keys", Some(&alice), None).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_history_lifecycle() {
    let app = spawn_app().await;
    let (alice, _) = app.register("alice@example.com").await;
    let (bob, _) = app.register("bob@example.com").await;

    let messages = json!({
        "messages": [
            { "role": "system", "content": "be brief" },
            { "role": "user", "content": "  How   do I\nparse TOML in Rust?  " },
            { "role": "assistant", "content": "Use the toml crate." }
        ]
    });
    let (status, saved) = app
        .json(Method::PUT, "/api/history/chat-1", Some(&alice), Some(messages))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["title"], "How do I parse TOML in Rust?");
    assert_eq!(saved["message_count"], 3);

    // Distinct updated_at for a stable order.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = json!({ "messages": [{ "role": "user", "content": "second chat" }] });
    app.json(Method::PUT, "/api/history/chat-2", Some(&alice), Some(second))
        .await;

    let (_, list) = app.json(Method::GET, "/api/history", Some(&alice), None).await;
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["chat-2", "chat-1"]);

    let (status, record) = app.json(Method::GET, "/api/history/chat-1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["messages"][2]["content"], "Use the toml crate.");

    // Other users see nothing.
    let (status, _) = app.json(Method::GET, "/api/history/chat-1", Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .json(
            Method::PUT,
            "/api/history/bad%20id",
            Some(&alice),
            Some(json!({ "messages": [{ "role": "user", "content": "x" }] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.json(Method::DELETE, "/api/history/chat-1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.json(Method::DELETE, "/api/history/chat-1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let app = spawn_app().await;
    let (token, _) = app.register("alice@example.com").await;

    let (status, body) = app
        .json(Method::GET, "/api/sessions/does-not-exist", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = spawn_app().await;
    let req = axum::http::Request::builder()
        .uri("/api/health")
        .header("x-request-id", "abc-123")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.send(req).await;
    assert_eq!(response.headers()["x-request-id"], "abc-123");
}
