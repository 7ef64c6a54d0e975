use axum::http::StatusCode;
use lumen::hardening::*;
use lumen::types::*;
use std::time::Duration;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: lumen::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: lumen::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(LumenError::Upstream(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "overloaded".to_string(),
                    )
                    .into())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_policy_gives_up_on_client_errors() {
    let policy = RetryPolicy::new(5, 1);
    let mut attempts = 0;

    let result: lumen::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move {
                Err(LumenError::Upstream(StatusCode::UNAUTHORIZED, "bad key".to_string()).into())
            }
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_stops_at_max_attempts() {
    let policy = RetryPolicy::new(2, 1);
    let mut attempts = 0;

    let result: lumen::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move {
                Err(LumenError::Upstream(StatusCode::TOO_MANY_REQUESTS, "slow down".to_string())
                    .into())
            }
        })
        .await;

    assert_eq!(result.unwrap_err().status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_circuit_breaker_trips() {
    let cb = CircuitBreaker::new(2, Duration::from_secs(1));

    cb.record_failure().await;
    assert!(cb.check().await.is_ok());

    cb.record_failure().await;
    let err = cb.check().await.unwrap_err();
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test]
async fn test_circuit_breaker_success_resets_count() {
    let cb = CircuitBreaker::new(2, Duration::from_secs(1));

    cb.record_failure().await;
    cb.record_success().await;
    cb.record_failure().await;
    assert!(cb.check().await.is_ok());
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_circuit_breaker_recovery() {
    let cb = CircuitBreaker::new(1, Duration::from_millis(50));

    cb.record_failure().await;
    assert!(cb.check().await.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Half-open lets a probe through.
    assert!(cb.check().await.is_ok());
    assert_eq!(cb.state().await, CircuitState::HalfOpen);

    cb.record_success().await;
    assert_eq!(cb.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_circuit_breaker_half_open_failure_reopens() {
    let cb = CircuitBreaker::new(3, Duration::from_millis(50));

    for _ in 0..3 {
        cb.record_failure().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cb.check().await.is_ok());

    cb.record_failure().await;
    assert_eq!(cb.state().await, CircuitState::Open);
    assert!(cb.check().await.is_err());
}
