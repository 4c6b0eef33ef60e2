//! Outbound webhook delivery with bounded exponential retry.
//!
//! Grounded on `original_source/app/webhooks.py`: the same payload
//! envelope, the same `min(60, 2**retry_count)` backoff, and the same
//! retry/no-retry split on response status and transport error. The
//! teacher has no webhook concept at all; the single-owner polling-loop
//! shape (a task that owns a retry queue and only it mutates it) follows
//! `PostHog-hog-rs/hook-worker/src/worker.rs`'s `WebhookWorker::run` loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::models::WebhookPayload;
use crate::store::JobStore;

struct PendingRetry {
    url: String,
    payload: WebhookPayload,
    attempt: u32,
    next_attempt_at: std::time::Instant,
}

impl PartialEq for PendingRetry {
    fn eq(&self, other: &Self) -> bool {
        self.next_attempt_at == other.next_attempt_at
    }
}
impl Eq for PendingRetry {}
impl Ord for PendingRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so the BinaryHeap (a max-heap) pops the earliest deadline.
        other.next_attempt_at.cmp(&self.next_attempt_at)
    }
}
impl PartialOrd for PendingRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-owner retry heap keyed on next-attempt-time, per the design
/// notes. Other components only call `enqueue`; only the dispatcher's own
/// background task pops from it.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    retry_queue: Mutex<BinaryHeap<PendingRetry>>,
    max_retries: u32,
    store: Arc<JobStore>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<JobStore>, timeout: Duration, max_retries: u32) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build webhook http client");

        Arc::new(Self {
            client,
            retry_queue: Mutex::new(BinaryHeap::new()),
            max_retries,
            store,
        })
    }

    /// Called by the Executor immediately after the terminal state has
    /// been written to the Job Store — never before, per §5's ordering
    /// guarantee (b).
    pub async fn dispatch(&self, url: String, payload: WebhookPayload) {
        let outcome = self.attempt_delivery(&url, &payload).await;
        match outcome {
            DeliveryOutcome::Delivered => {
                self.record_status(&payload.request_id, "sent").await;
            }
            DeliveryOutcome::Retry => {
                self.enqueue_retry(url, payload, 1).await;
            }
            DeliveryOutcome::GiveUp => {
                self.record_status(&payload.request_id, "failed").await;
            }
        }
    }

    async fn enqueue_retry(&self, url: String, payload: WebhookPayload, attempt: u32) {
        if attempt > self.max_retries {
            self.record_status(&payload.request_id, "failed").await;
            return;
        }
        let delay = backoff_delay(attempt);
        let mut queue = self.retry_queue.lock().await;
        queue.push(PendingRetry {
            url,
            payload,
            attempt,
            next_attempt_at: std::time::Instant::now() + delay,
        });
    }

    async fn record_status(&self, request_id: &str, status: &str) {
        if let Err(e) = self.store.set_webhook_status(request_id, status).await {
            error!(request_id, error = %e, "failed to record webhook delivery status");
        }
    }

    async fn attempt_delivery(&self, url: &str, payload: &WebhookPayload) -> DeliveryOutcome {
        let response = self.client.post(url).json(payload).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    DeliveryOutcome::Delivered
                } else if is_retryable_status(status) {
                    warn!(request_id = %payload.request_id, %status, "webhook delivery will retry");
                    DeliveryOutcome::Retry
                } else {
                    warn!(request_id = %payload.request_id, %status, "webhook delivery failed, not retrying");
                    DeliveryOutcome::GiveUp
                }
            }
            Err(e) if is_retryable_error(&e) => {
                warn!(request_id = %payload.request_id, error = %e, "webhook transport error, will retry");
                DeliveryOutcome::Retry
            }
            Err(e) => {
                warn!(request_id = %payload.request_id, error = %e, "webhook transport error, not retrying");
                DeliveryOutcome::GiveUp
            }
        }
    }

    /// The dispatcher's own background task: wakes up, fires anything
    /// whose deadline has passed, re-enqueues or gives up per job. A
    /// restart loses whatever is in this queue — an accepted loss per
    /// §4.6 and the design notes' resolved Open Question on retry
    /// durability.
    pub fn spawn_retry_loop(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() && self.retry_queue.lock().await.is_empty() {
                    break;
                }

                let due: Vec<PendingRetry> = {
                    let mut queue = self.retry_queue.lock().await;
                    let mut due = Vec::new();
                    while let Some(top) = queue.peek() {
                        if top.next_attempt_at <= std::time::Instant::now() {
                            due.push(queue.pop().unwrap());
                        } else {
                            break;
                        }
                    }
                    due
                };

                if due.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                for item in due {
                    let outcome = self.attempt_delivery(&item.url, &item.payload).await;
                    match outcome {
                        DeliveryOutcome::Delivered => {
                            self.record_status(&item.payload.request_id, "sent").await;
                        }
                        DeliveryOutcome::Retry => {
                            self.enqueue_retry(item.url, item.payload, item.attempt + 1).await;
                        }
                        DeliveryOutcome::GiveUp => {
                            self.record_status(&item.payload.request_id, "failed").await;
                        }
                    }
                }
            }
            info!("webhook dispatcher retry loop stopped");
        });
    }

    pub async fn pending_count(&self) -> usize {
        self.retry_queue.lock().await.len()
    }
}

enum DeliveryOutcome {
    Delivered,
    Retry,
    GiveUp,
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// `min(60, 2^attempt)` seconds, per §4.6.
fn backoff_delay(attempt: u32) -> Duration {
    let seconds = 2u64.saturating_pow(attempt).min(60);
    Duration::from_secs(seconds)
}

pub fn build_payload(
    event_type: &str,
    job: &crate::models::Job,
    video_url: Option<String>,
) -> WebhookPayload {
    WebhookPayload {
        event_type: event_type.to_string(),
        request_id: job.request_id.clone(),
        api_key_id: job.api_key_id,
        status: job.status,
        execution_time: job.execution_time.unwrap_or(0.0),
        video_url,
        result: job.result.clone(),
        error: job.error_message.clone(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_at_sixty_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn server_errors_and_429_are_retryable() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
