use anyhow::Context;
use clap::Parser;
use lumen::auth::{decode_secret_key, AuthConfig, AuthManager};
use lumen::constants::JWT_SECRET_ENV;
use lumen::db::init_db;
use lumen::json_log_layer::JsonLogLayer;
use lumen::providers::ProviderRegistry;
use lumen::redaction_layer::RedactingWriter;
use lumen::sessions::spawn_session_gc;
use lumen::{build_router, AppState, Args};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "lumen=debug,tower_http=info".into(),
    };

    // NDJSON event log (logs/lumen.ndjson.YYYY-MM-DD), secrets masked before they hit disk
    let _ = std::fs::create_dir_all("logs");
    let json_appender = tracing_appender::rolling::daily("logs", "lumen.ndjson");
    let (json_non_blocking, _json_guard) = tracing_appender::non_blocking(json_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(JsonLogLayer::new(RedactingWriter::new(json_non_blocking)))
        .with(tracing_error::ErrorLayer::default())
        .init();

    lumen::logging::setup_panic_hook();

    let args = Args::parse();

    let raw_secret = std::env::var(JWT_SECRET_ENV)
        .with_context(|| format!("{} environment variable is missing", JWT_SECRET_ENV))?;
    let jwt_secret = decode_secret_key(&raw_secret)
        .with_context(|| format!("{} is invalid", JWT_SECRET_ENV))?;
    let auth = AuthManager::new(&AuthConfig {
        jwt_secret,
        access_token_ttl: Duration::from_secs(args.access_token_ttl_secs),
        refresh_token_ttl: Duration::from_secs(args.refresh_token_ttl_secs),
    });

    let db = init_db(&args.database)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;

    let providers = ProviderRegistry::builtin(
        args.circuit_breaker_threshold,
        Duration::from_secs(args.circuit_breaker_recovery_secs),
    )
    .with_env_keys();

    let state = Arc::new(
        AppState::new(args, db, auth, providers)
            .map_err(|e| anyhow::anyhow!("Failed to build application state: {}", e))?,
    );
    state
        .storage
        .ensure_root()
        .await
        .with_context(|| format!("Failed to create storage dir {:?}", state.storage.root()))?;

    let _gc = spawn_session_gc(state.clone(), state.session_gc_interval(), state.session_ttl());

    let app = build_router(state.clone());
    let addr = format!("{}:{}", state.args.host, state.args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("Lumen listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
