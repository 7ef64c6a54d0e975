#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::Router;
use clap::Parser;
use lumen::auth::{AuthConfig, AuthManager};
use lumen::db::init_db;
use lumen::providers::ProviderRegistry;
use lumen::{build_router, AppState, Args};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const TEST_SECRET: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
pub const PASSWORD: &str = "correct horse battery";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub dir: TempDir,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(ProviderRegistry::builtin(3, Duration::from_secs(30)), &[]).await
}

/// Builds the full router over a temp database and storage dir.
pub async fn spawn_app_with(providers: ProviderRegistry, extra_args: &[&str]) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("lumen.db");
    let storage_dir = dir.path().join("storage");

    let mut argv = vec![
        "lumen".to_string(),
        "--database".to_string(),
        db_path.to_string_lossy().to_string(),
        "--storage-dir".to_string(),
        storage_dir.to_string_lossy().to_string(),
        "--max-retries".to_string(),
        "1".to_string(),
    ];
    argv.extend(extra_args.iter().map(|a| a.to_string()));
    let args = Args::parse_from(argv);

    let db = init_db(&db_path).await.unwrap();
    let auth = AuthManager::new(&AuthConfig {
        jwt_secret: TEST_SECRET.to_vec(),
        access_token_ttl: Duration::from_secs(args.access_token_ttl_secs),
        refresh_token_ttl: Duration::from_secs(args.refresh_token_ttl_secs),
    });
    let state = Arc::new(AppState::new(args, db, auth, providers).unwrap());
    state.storage.ensure_root().await.unwrap();

    TestApp {
        router: build_router(state.clone()),
        state,
        dir,
    }
}

impl TestApp {
    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.unwrap()
    }

    pub async fn json(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }
        let req = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.send(req).await;
        let status = response.status();
        (status, body_json(response).await)
    }

    /// Registers an account and returns (access_token, refresh_token).
    pub async fn register(&self, email: &str) -> (String, String) {
        let (status, body) = self
            .json(
                Method::POST,
                "/api/auth/register",
                None,
                Some(serde_json::json!({ "email": email, "password": PASSWORD })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
        (
            body["access_token"].as_str().unwrap().to_string(),
            body["refresh_token"].as_str().unwrap().to_string(),
        )
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = body_bytes(response).await;
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }
}
