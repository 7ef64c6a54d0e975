use crate::constants::RETRYABLE_STATUS_CODES;
use crate::types::{LumenError, ObservedError, Result};
use axum::http::StatusCode;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.backoff(attempts);
                    tracing::warn!(
                        "Upstream call failed (attempt {}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base_delay = self.base_delay_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
        // ±25% jitter
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }

    pub fn is_retryable(err: &ObservedError) -> bool {
        match &err.inner {
            LumenError::Network(e) => e.is_connect() || e.is_timeout(),
            LumenError::Upstream(status, _) => RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state == CircuitState::Open {
            let recovered = match *self.last_failure_time.read().await {
                Some(last) => last.elapsed() > self.recovery_timeout,
                None => true,
            };

            if recovered {
                tracing::info!("Circuit breaker transitioning to Half-Open");
                *state = CircuitState::HalfOpen;
                return Ok(());
            }

            return Err(LumenError::Upstream(
                StatusCode::SERVICE_UNAVAILABLE,
                "Provider temporarily unavailable (circuit open)".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if *state != CircuitState::Closed {
            tracing::info!("Circuit breaker transitioning to CLOSED");
            *state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());

        let should_open = failures >= self.failure_threshold || *state == CircuitState::HalfOpen;
        if should_open && *state != CircuitState::Open {
            tracing::error!(
                "Circuit breaker transitioning to OPEN ({} consecutive failures)",
                failures
            );
            *state = CircuitState::Open;
        }
    }
}

/// Counts failed logins per account inside a fixed window.
pub struct LoginThrottle {
    max_failures: u32,
    window: Duration,
    attempts: Mutex<HashMap<String, (u32, Instant)>>,
}

impl LoginThrottle {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> Result<()> {
        let mut attempts = self.attempts.lock().await;
        if let Some((count, started)) = attempts.get(key).copied() {
            if started.elapsed() > self.window {
                attempts.remove(key);
            } else if count >= self.max_failures {
                return Err(LumenError::RateLimited(
                    "Too many failed login attempts. Try again later.".to_string(),
                )
                .into());
            }
        }
        Ok(())
    }

    pub async fn record_failure(&self, key: &str) {
        let mut attempts = self.attempts.lock().await;
        let entry = attempts
            .entry(key.to_string())
            .or_insert((0, Instant::now()));
        if entry.1.elapsed() > self.window {
            *entry = (0, Instant::now());
        }
        entry.0 += 1;
        if entry.0 >= self.max_failures {
            tracing::warn!("Login throttled after {} failed attempts", entry.0);
        }
    }

    pub async fn clear(&self, key: &str) {
        self.attempts.lock().await.remove(key);
    }

    /// Forgets windows that have already elapsed.
    pub async fn prune(&self) {
        let window = self.window;
        self.attempts
            .lock()
            .await
            .retain(|_, (_, started)| started.elapsed() <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_failures_are_retryable() {
        let throttled: ObservedError =
            LumenError::Upstream(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).into();
        assert!(RetryPolicy::is_retryable(&throttled));

        let bad_request: ObservedError =
            LumenError::Upstream(StatusCode::BAD_REQUEST, "nope".into()).into();
        assert!(!RetryPolicy::is_retryable(&bad_request));

        let validation: ObservedError = LumenError::Validation("bad".into()).into();
        assert!(!RetryPolicy::is_retryable(&validation));
    }

    #[tokio::test]
    async fn test_login_throttle_window() {
        let throttle = LoginThrottle::new(2, Duration::from_millis(50));
        throttle.record_failure("a@b.c").await;
        assert!(throttle.check("a@b.c").await.is_ok());
        throttle.record_failure("a@b.c").await;
        assert!(throttle.check("a@b.c").await.is_err());
        assert!(throttle.check("other@b.c").await.is_ok());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(throttle.check("a@b.c").await.is_ok());
    }

    #[tokio::test]
    async fn test_login_throttle_clear() {
        let throttle = LoginThrottle::new(1, Duration::from_secs(60));
        throttle.record_failure("a@b.c").await;
        assert!(throttle.check("a@b.c").await.is_err());
        throttle.clear("a@b.c").await;
        assert!(throttle.check("a@b.c").await.is_ok());
    }
}
