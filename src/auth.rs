use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use argon2::{
    password_hash::{
        rand_core::OsRng, Error as PasswordHashError, PasswordHash, PasswordHasher,
        PasswordVerifier, SaltString,
    },
    Argon2,
};
use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::{LumenError, Result, UserId};
use crate::AppState;

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: Vec<u8>,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub typ: TokenKind,
    pub jti: String,
    pub iat: u64,
    pub exp: u64,
}

/// The authenticated caller, inserted as a request extension by [`require_auth`].
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub id: UserId,
    pub email: String,
}

pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_jti: String,
    pub refresh_expires_at: u64,
    pub expires_in: u64,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        Self {
            encoding_key: EncodingKey::from_secret(&config.jwt_secret),
            decoding_key: DecodingKey::from_secret(&config.jwt_secret),
            validation,
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub async fn hash_password(password: &str) -> Result<String> {
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| LumenError::internal(format!("Failed to hash password: {e}")))
        })
        .await
        .map_err(|e| LumenError::internal(format!("Hashing task failed: {e}")))?
        .map_err(Into::into)
    }

    /// Returns `Ok(false)` on a mismatch; only malformed hashes are errors.
    pub async fn verify_password(candidate: &str, stored_hash: &str) -> Result<bool> {
        let candidate = candidate.to_string();
        let stored_hash = stored_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&stored_hash)
                .map_err(|e| LumenError::internal(format!("Invalid stored password hash: {e}")))?;
            match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
                Ok(()) => Ok(true),
                Err(PasswordHashError::Password) => Ok(false),
                Err(other) => Err(LumenError::internal(format!(
                    "Password verification failed: {other}"
                ))),
            }
        })
        .await
        .map_err(|e| LumenError::internal(format!("Verification task failed: {e}")))?
        .map_err(Into::into)
    }

    fn sign(&self, user_id: &UserId, email: &str, typ: TokenKind, ttl: Duration) -> Result<Claims> {
        let now = unix_now()?;
        Ok(Claims {
            sub: user_id.0.clone(),
            email: email.to_string(),
            typ,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + ttl.as_secs(),
        })
    }

    pub fn encode_claims(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| LumenError::internal(format!("Failed to sign token: {e}")).into())
    }

    pub fn issue_tokens(&self, user_id: &UserId, email: &str) -> Result<IssuedTokens> {
        let access = self.sign(user_id, email, TokenKind::Access, self.access_ttl)?;
        let refresh = self.sign(user_id, email, TokenKind::Refresh, self.refresh_ttl)?;
        Ok(IssuedTokens {
            access_token: self.encode_claims(&access)?,
            refresh_token: self.encode_claims(&refresh)?,
            refresh_jti: refresh.jti,
            refresh_expires_at: refresh.exp,
            expires_in: self.access_ttl.as_secs(),
        })
    }

    pub fn verify_token(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    LumenError::Unauthorized("Token expired".to_string())
                }
                _ => LumenError::Unauthorized("Invalid token".to_string()),
            })?;

        if claims.typ != expected {
            return Err(LumenError::Unauthorized("Invalid token type".to_string()).into());
        }
        Ok(claims)
    }
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| LumenError::internal("System clock is before UNIX_EPOCH").into())
}

/// Accepts base64 for exactly 32 bytes, or a raw 32-character ASCII secret.
pub fn decode_secret_key(raw: &str) -> anyhow::Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        anyhow::bail!("JWT secret cannot be empty");
    }
    let decoded = match BASE64.decode(trimmed) {
        Ok(bytes) if bytes.len() == 32 => bytes,
        _ if trimmed.len() == 32 => trimmed.as_bytes().to_vec(),
        Ok(_) => anyhow::bail!("JWT secret must decode to exactly 32 bytes"),
        Err(_) => {
            anyhow::bail!("JWT secret must be base64 encoded or a 32-byte ASCII string")
        }
    };

    Ok(decoded)
}

pub fn bearer_token(request: &Request<Body>) -> Option<&str> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?;

    let mut parts = header.splitn(2, ' ');
    let (Some(scheme), Some(token)) = (parts.next(), parts.next()) else {
        return None;
    };

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(&request)
        .ok_or_else(|| LumenError::Unauthorized("Missing bearer token".to_string()))?;

    let claims = state.auth.verify_token(token, TokenKind::Access)?;

    // Tokens outlive deleted accounts.
    let user_id = UserId(claims.sub);
    let user = crate::accounts::find_user_by_id(&state.db, &user_id)
        .await?
        .ok_or_else(|| LumenError::Unauthorized("Unknown user".to_string()))?;

    tracing::Span::current().record("user", user.id.short());
    request.extensions_mut().insert(AuthUser {
        id: user.id,
        email: user.email,
    });
    Ok(next.run(request).await)
}
