use std::time::Duration;
use thiserror::Error;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Error taxonomy for the execution core. Each variant maps to exactly one
/// row of the error handling design: a cause, an HTTP surface, and whether
/// the core retries it on its own.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("queue is at capacity")]
    QueueFull,

    #[error("script temporarily blocked after repeated failures")]
    ScriptTemporarilyBlocked,

    #[error("no browser available: {0}")]
    BrowserUnavailable(String),

    #[error("execution exceeded its timeout")]
    ExecutionTimeout,

    #[error("execution failed: {0}")]
    ExecutionError(String),

    #[error("webhook delivery failed after retries: {0}")]
    WebhookTransient(String),

    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ScriptTemporarilyBlocked => StatusCode::TOO_MANY_REQUESTS,
            CoreError::BrowserUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::ExecutionTimeout => StatusCode::OK,
            CoreError::ExecutionError(_) => StatusCode::OK,
            CoreError::WebhookTransient(_) => StatusCode::OK,
            CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Storage(_) | CoreError::Io(_) | CoreError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::WebhookTransient(_))
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            CoreError::Validation(reasons) => json!({ "error": "validation_error", "reasons": reasons }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A single fingerprint's failure counter. Kept structurally identical to
/// the teacher's global breaker; the table below is what makes it per-job.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: std::sync::Arc<std::sync::Mutex<CircuitState>>,
    failure_threshold: usize,
    recovery_timeout: Duration,
    failure_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    last_failure_time: std::sync::Arc<std::sync::Mutex<Option<std::time::Instant>>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(CircuitState::Closed)),
            failure_threshold,
            recovery_timeout,
            failure_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            last_failure_time: std::sync::Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn can_execute(&self) -> bool {
        let state = *self.state.lock().unwrap();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = *self.last_failure_time.lock().unwrap() {
                    if last_failure.elapsed() > self.recovery_timeout {
                        *self.state.lock().unwrap() = CircuitState::HalfOpen;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        self.failure_count
            .store(0, std::sync::atomic::Ordering::Relaxed);
        *self.state.lock().unwrap() = CircuitState::Closed;
        *self.last_failure_time.lock().unwrap() = None;
    }

    /// Returns the failure count observed after this failure.
    pub fn record_failure(&self) -> usize {
        let failures = self
            .failure_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        *self.last_failure_time.lock().unwrap() = Some(std::time::Instant::now());

        if failures >= self.failure_threshold {
            *self.state.lock().unwrap() = CircuitState::Open;
        }
        failures
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.lock().unwrap()
    }

    pub fn get_failure_count(&self) -> usize {
        self.failure_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn is_idle(&self) -> bool {
        self.get_state() == CircuitState::Closed && self.get_failure_count() == 0
    }
}

/// Per-fingerprint circuit breakers. Submission consults this before a job
/// ever reaches the queue; the Executor reports back into it on completion.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerTable {
    breakers: std::sync::Arc<dashmap::DashMap<String, CircuitBreaker>>,
    failure_threshold: usize,
    recovery_timeout: Duration,
}

impl CircuitBreakerTable {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            breakers: std::sync::Arc::new(dashmap::DashMap::new()),
            failure_threshold,
            recovery_timeout,
        }
    }

    pub fn can_execute(&self, fingerprint: &str) -> bool {
        match self.breakers.get(fingerprint) {
            Some(b) => b.can_execute(),
            None => true,
        }
    }

    pub fn record_success(&self, fingerprint: &str) {
        if let Some(b) = self.breakers.get(fingerprint) {
            b.record_success();
        }
    }

    /// Records a failure, lazily creating an entry for this fingerprint.
    pub fn record_failure(&self, fingerprint: &str) -> usize {
        self.breakers
            .entry(fingerprint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.failure_threshold, self.recovery_timeout))
            .record_failure()
    }

    pub fn is_open(&self, fingerprint: &str) -> bool {
        self.breakers
            .get(fingerprint)
            .map(|b| b.get_state() == CircuitState::Open)
            .unwrap_or(false)
    }

    /// Drops idle entries (closed, zero failures). Called from the cleanup
    /// sweep so the table does not grow unbounded with one-off fingerprints.
    pub fn reap_idle(&self) {
        self.breakers.retain(|_, b| !b.is_idle());
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.get_state() == CircuitState::Open)
            .count()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(b.can_execute());
        b.record_failure();
        b.record_failure();
        assert!(b.can_execute());
        b.record_failure();
        assert!(!b.can_execute());
        assert_eq!(b.get_state(), CircuitState::Open);
    }

    #[test]
    fn table_is_per_fingerprint() {
        let table = CircuitBreakerTable::new(2, Duration::from_secs(60));
        table.record_failure("a");
        table.record_failure("a");
        assert!(table.is_open("a"));
        assert!(table.can_execute("b"));
    }

    #[test]
    fn success_resets_counter() {
        let b = CircuitBreaker::new(2, Duration::from_secs(60));
        b.record_failure();
        b.record_success();
        assert_eq!(b.get_failure_count(), 0);
        assert!(b.can_execute());
    }
}
