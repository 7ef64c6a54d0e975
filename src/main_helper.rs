use crate::auth::{require_auth, AuthManager};
use crate::constants::{LOGIN_FAILURE_WINDOW_SECS, LOGIN_MAX_FAILURES};
use crate::db::DbPool;
use crate::hardening::LoginThrottle;
use crate::providers::ProviderRegistry;
use crate::sessions::SessionStore;
use crate::storage::StorageService;
use crate::types::Result;
use crate::{accounts, api_keys, chat, health, history, logging, providers, sessions, storage};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "lumen.db")]
    pub database: String,
    #[arg(long, default_value = "storage")]
    pub storage_dir: String,
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    pub storage_quota_bytes: u64,
    #[arg(long, default_value_t = 15 * 60)]
    pub access_token_ttl_secs: u64,
    #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
    pub refresh_token_ttl_secs: u64,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 30)]
    pub circuit_breaker_recovery_secs: u64,
    #[arg(long, default_value_t = 60 * 60)]
    pub session_ttl_secs: u64,
    #[arg(long, default_value_t = 60)]
    pub session_gc_interval_secs: u64,
}

pub struct AppState {
    pub client: reqwest::Client,
    pub db: DbPool,
    pub auth: AuthManager,
    pub providers: ProviderRegistry,
    pub sessions: Arc<SessionStore>,
    pub storage: StorageService,
    pub login_throttle: LoginThrottle,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(
        args: Args,
        db: DbPool,
        auth: AuthManager,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(args.request_timeout_secs))
            .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;

        Ok(Self {
            client,
            db,
            auth,
            providers,
            sessions: Arc::new(SessionStore::new()),
            storage: StorageService::new(&args.storage_dir, args.storage_quota_bytes),
            login_throttle: LoginThrottle::new(
                LOGIN_MAX_FAILURES,
                Duration::from_secs(LOGIN_FAILURE_WINDOW_SECS),
            ),
            args: Arc::new(args),
        })
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.args.session_ttl_secs)
    }

    pub fn session_gc_interval(&self) -> Duration {
        Duration::from_secs(self.args.session_gc_interval_secs.max(1))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/health", get(health::liveness))
        .route("/api/health/ready", get(health::readiness))
        .route("/api/providers", get(providers::list_providers))
        .route("/api/auth/register", post(accounts::register))
        .route("/api/auth/login", post(accounts::login))
        .route("/api/auth/refresh", post(accounts::refresh))
        .route("/api/auth/reset-password", post(accounts::request_password_reset))
        .route(
            "/api/auth/reset-password/confirm",
            post(accounts::confirm_password_reset),
        );

    let protected = Router::new()
        .route("/api/auth/logout", post(accounts::logout))
        .route("/api/auth/validate", get(accounts::validate))
        .route("/api/chat", get(chat::list_chat_providers).post(chat::chat))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/keys", get(api_keys::list_keys))
        .route(
            "/api/keys/:provider",
            put(api_keys::put_key).delete(api_keys::delete_key),
        )
        .route("/api/history", get(history::list_history))
        .route(
            "/api/history/:id",
            get(history::get_history)
                .put(history::put_history)
                .delete(history::delete_history),
        )
        .route("/api/storage/upload", post(storage::upload))
        .route("/api/storage/files", get(storage::list_files))
        .route(
            "/api/storage/files/:id",
            get(storage::download).delete(storage::delete_file),
        )
        .route("/api/storage/usage", get(storage::usage))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(logging::request_id_middleware))
        .with_state(state)
}
