use crate::auth::{AuthManager, AuthUser, TokenKind};
use crate::constants::{
    MAX_PASSWORD_LEN, MIN_PASSWORD_LEN, PASSWORD_RESET_TTL_SECS, RESET_REQUESTED_MESSAGE,
};
use crate::db::DbPool;
use crate::types::{
    format_timestamp, now_timestamp, parse_timestamp, ApiJson, LumenError, Result, UserId,
};
use crate::AppState;
use axum::{extract::State, http::StatusCode, Extension, Json};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid email regex");
}

const INVALID_CREDENTIALS: &str = "Invalid email or password";

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub email: String,
    pub created_at: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            created_at: user.created_at.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub user: UserView,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize, Default)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub user: AuthUser,
}

pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    if email.len() > 254 || !EMAIL_REGEX.is_match(&email) {
        return Err(LumenError::Validation("A valid email address is required".to_string()).into());
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(LumenError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ))
        .into());
    }
    if len > MAX_PASSWORD_LEN {
        return Err(LumenError::Validation(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LEN
        ))
        .into());
    }
    Ok(())
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: UserId(row.get("id")),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        created_at: row.get("created_at"),
    }
}

pub async fn find_user_by_id(db: &DbPool, id: &UserId) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, email, password_hash, created_at FROM users WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(db)
        .await?;
    Ok(row.as_ref().map(user_from_row))
}

pub async fn find_user_by_email(db: &DbPool, email: &str) -> Result<Option<User>> {
    let row =
        sqlx::query("SELECT id, email, password_hash, created_at FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(db)
            .await?;
    Ok(row.as_ref().map(user_from_row))
}

async fn insert_user(db: &DbPool, email: &str, password_hash: &str) -> Result<User> {
    let user = User {
        id: UserId::new(),
        email: email.to_string(),
        password_hash: password_hash.to_string(),
        created_at: now_timestamp(),
    };

    let inserted = sqlx::query(
        "INSERT INTO users (id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&user.id.0)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(&user.created_at)
    .execute(db)
    .await;

    match inserted {
        Ok(_) => Ok(user),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(LumenError::Conflict("Email already registered".to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn unix_to_timestamp(secs: u64) -> Result<String> {
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .map(format_timestamp)
        .ok_or_else(|| LumenError::internal("Token expiry out of range").into())
}

async fn issue_session(state: &AppState, user: &User) -> Result<AuthResponse> {
    let tokens = state.auth.issue_tokens(&user.id, &user.email)?;

    sqlx::query("INSERT INTO refresh_tokens (jti, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(&tokens.refresh_jti)
        .bind(&user.id.0)
        .bind(unix_to_timestamp(tokens.refresh_expires_at)?)
        .execute(&state.db)
        .await?;

    Ok(AuthResponse {
        user: UserView::from(user),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        token_type: "Bearer",
        expires_in: tokens.expires_in,
    })
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<CredentialsRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let email = normalize_email(&payload.email)?;
    validate_password(&payload.password)?;

    if find_user_by_email(&state.db, &email).await?.is_some() {
        return Err(LumenError::Conflict("Email already registered".to_string()).into());
    }

    let hash = AuthManager::hash_password(&payload.password).await?;
    let user = insert_user(&state.db, &email, &hash).await?;
    tracing::info!(user = %user.id.short(), "Registered new account");

    let response = issue_session(&state, &user).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

static DUMMY_PASSWORD_HASH: OnceCell<String> = OnceCell::const_new();

/// Stand-in hash for unknown emails, so that login costs one argon2 verify
/// whether or not the account exists.
async fn dummy_password_hash() -> Result<&'static str> {
    DUMMY_PASSWORD_HASH
        .get_or_try_init(|| AuthManager::hash_password("lumen-unknown-account"))
        .await
        .map(String::as_str)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<CredentialsRequest>,
) -> Result<Json<AuthResponse>> {
    let email = normalize_email(&payload.email)?;
    state.login_throttle.check(&email).await?;

    let user = match find_user_by_email(&state.db, &email).await? {
        Some(u) => u,
        None => {
            let dummy = dummy_password_hash().await?;
            let _ = AuthManager::verify_password(&payload.password, dummy).await;
            state.login_throttle.record_failure(&email).await;
            return Err(LumenError::Unauthorized(INVALID_CREDENTIALS.to_string()).into());
        }
    };

    if !AuthManager::verify_password(&payload.password, &user.password_hash).await? {
        state.login_throttle.record_failure(&email).await;
        tracing::info!(user = %user.id.short(), "Rejected login: wrong password");
        return Err(LumenError::Unauthorized(INVALID_CREDENTIALS.to_string()).into());
    }

    state.login_throttle.clear(&email).await;
    tracing::info!(user = %user.id.short(), "Login succeeded");
    Ok(Json(issue_session(&state, &user).await?))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    payload: Option<Json<LogoutRequest>>,
) -> Result<StatusCode> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();

    match payload.refresh_token {
        Some(token) => {
            let claims = state.auth.verify_token(&token, TokenKind::Refresh)?;
            if claims.sub != user.id.0 {
                return Err(LumenError::Unauthorized("Invalid token".to_string()).into());
            }
            sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE jti = ? AND user_id = ?")
                .bind(&claims.jti)
                .bind(&user.id.0)
                .execute(&state.db)
                .await?;
        }
        None => {
            revoke_all_refresh_tokens(&state.db, &user.id).await?;
        }
    }

    tracing::info!(user = %user.id.short(), "Logged out");
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_all_refresh_tokens(db: &DbPool, user_id: &UserId) -> Result<u64> {
    let revoked = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?")
        .bind(&user_id.0)
        .execute(db)
        .await?
        .rows_affected();
    Ok(revoked)
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<RefreshRequest>,
) -> Result<Json<AuthResponse>> {
    let claims = state
        .auth
        .verify_token(&payload.refresh_token, TokenKind::Refresh)?;

    // Single use: only the request that flips `revoked` may rotate.
    let rotated = sqlx::query(
        "UPDATE refresh_tokens SET revoked = 1 WHERE jti = ? AND user_id = ? AND revoked = 0",
    )
    .bind(&claims.jti)
    .bind(&claims.sub)
    .execute(&state.db)
    .await?
    .rows_affected();

    if rotated != 1 {
        tracing::warn!("Rejected refresh with revoked or unknown token");
        return Err(LumenError::Unauthorized("Refresh token revoked".to_string()).into());
    }

    let user = find_user_by_id(&state.db, &UserId(claims.sub))
        .await?
        .ok_or_else(|| LumenError::Unauthorized("Unknown user".to_string()))?;

    Ok(Json(issue_session(&state, &user).await?))
}

pub async fn validate(Extension(user): Extension<AuthUser>) -> Json<ValidateResponse> {
    Json(ValidateResponse { valid: true, user })
}

pub fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Always answers with the same body so that account existence is not disclosed.
pub async fn request_password_reset(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ResetRequest>,
) -> Result<Json<MessageResponse>> {
    let email = normalize_email(&payload.email)?;

    if let Some(user) = find_user_by_email(&state.db, &email).await? {
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let expires_at =
            format_timestamp(Utc::now() + chrono::Duration::seconds(PASSWORD_RESET_TTL_SECS));

        sqlx::query("INSERT INTO password_resets (token_hash, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(hash_reset_token(&token))
            .bind(&user.id.0)
            .bind(&expires_at)
            .execute(&state.db)
            .await?;

        // No mail transport; operators relay the token out of band.
        tracing::debug!(user = %user.id.short(), reset_token = %token, "Password reset token issued");
    } else {
        tracing::debug!("Password reset requested for unknown account");
    }

    Ok(Json(MessageResponse {
        message: RESET_REQUESTED_MESSAGE,
    }))
}

pub async fn confirm_password_reset(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ResetConfirmRequest>,
) -> Result<Json<MessageResponse>> {
    validate_password(&payload.new_password)?;
    let invalid = || LumenError::Validation("Invalid or expired reset token".to_string());

    let row = sqlx::query(
        "SELECT user_id, expires_at, used FROM password_resets WHERE token_hash = ?",
    )
    .bind(hash_reset_token(payload.token.trim()))
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(invalid)?;

    let user_id = UserId(row.get("user_id"));
    let expires_at: String = row.get("expires_at");
    let used: i64 = row.get("used");

    let expired = match parse_timestamp(&expires_at) {
        Some(ts) => ts <= Utc::now(),
        None => true,
    };
    if used != 0 || expired {
        return Err(invalid().into());
    }

    let hash = AuthManager::hash_password(&payload.new_password).await?;

    let mut tx = state.db.begin().await?;
    let claimed = sqlx::query("UPDATE password_resets SET used = 1 WHERE token_hash = ? AND used = 0")
        .bind(hash_reset_token(payload.token.trim()))
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if claimed != 1 {
        return Err(invalid().into());
    }
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(&hash)
        .bind(&user_id.0)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?")
        .bind(&user_id.0)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(user = %user_id.short(), "Password reset completed");
    Ok(Json(MessageResponse {
        message: "Password has been reset",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Alice@Example.COM ").unwrap(), "alice@example.com");
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("a@b").is_err());
        assert!(normalize_email("a b@c.d").is_err());
    }

    #[test]
    fn test_validate_password_bounds() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password(&"x".repeat(MAX_PASSWORD_LEN + 1)).is_err());
    }

    #[test]
    fn test_reset_token_hash_is_stable_hex() {
        let a = hash_reset_token("token");
        assert_eq!(a, hash_reset_token("token"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_reset_token("other"));
    }

    #[tokio::test]
    async fn test_unknown_account_hash_is_cached_and_real() {
        let first = dummy_password_hash().await.unwrap();
        let second = dummy_password_hash().await.unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(first.starts_with("$argon2"));
        assert!(!AuthManager::verify_password("correct horse battery", first)
            .await
            .unwrap());
    }
}
