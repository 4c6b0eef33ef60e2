//! The worker pool: N tasks sharing one `PriorityQueue`, each leasing a
//! browser, running a job through the Executor, and dispatching the
//! resulting webhook.
//!
//! Grounded on the teacher's `worker.rs` (`ScreenshotWorker`/`WorkerPool`:
//! N workers sharing one receiver, `processed_count`/`error_count` stats)
//! generalized from "pull a `ScreenshotRequest` off an mpsc channel, call
//! `ScreenshotService::screenshot_single`" to "pop a `QueueItem` off the
//! priority queue, lease a browser, call `Executor::run`, write the store,
//! enqueue a webhook." `BatchProcessor`/`ProgressTracker` have no
//! counterpart now that the service is a long-running server rather than a
//! CLI batch tool, and are dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser_pool::BrowserPool;
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::models::{ExecutionOutcome, JobStatus};
use crate::queue::PriorityQueue;
use crate::store::JobStore;
use crate::webhook::{build_payload, WebhookDispatcher};

/// How long shutdown waits for a job already in flight to reach a terminal
/// state, per §4.3, before forcing the job FAILED and moving on.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

pub struct Worker {
    id: usize,
    queue: Arc<PriorityQueue>,
    browser_pool: Arc<BrowserPool>,
    executor: Arc<Executor>,
    store: Arc<JobStore>,
    webhooks: Arc<WebhookDispatcher>,
    metrics: Arc<Metrics>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl Worker {
    fn new(
        id: usize,
        queue: Arc<PriorityQueue>,
        browser_pool: Arc<BrowserPool>,
        executor: Arc<Executor>,
        store: Arc<JobStore>,
        webhooks: Arc<WebhookDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            queue,
            browser_pool,
            executor,
            store,
            webhooks,
            metrics,
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = self.id, "worker started");

        loop {
            let item = tokio::select! {
                item = self.queue.pop() => item,
                _ = shutdown.cancelled() => {
                    info!(worker_id = self.id, "worker stopping, queue drain left to shutdown");
                    break;
                }
            };

            let job = match self.store.get_job(&item.request_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(worker_id = self.id, request_id = %item.request_id, "queued job vanished from store");
                    continue;
                }
                Err(e) => {
                    error!(worker_id = self.id, request_id = %item.request_id, error = %e, "failed to load queued job");
                    continue;
                }
            };

            let queue_wait = (chrono::Utc::now() - job.created_at)
                .to_std()
                .unwrap_or_default();

            let handle = match self.browser_pool.get_browser().await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(worker_id = self.id, request_id = %job.request_id, error = %e, "no browser available, failing job");
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self
                        .store
                        .mark_terminal(
                            &job.request_id,
                            JobStatus::Failed,
                            0.0,
                            None,
                            None,
                            None,
                            None,
                            None,
                            Some(&e.to_string()),
                        )
                        .await
                    {
                        error!(request_id = %job.request_id, error = %e, "failed to write terminal state for browser-unavailable job");
                    }
                    self.dispatch_webhook_if_configured(&job.request_id).await;
                    continue;
                }
            };

            let outcome = self.run_with_shutdown_grace(&job, handle, queue_wait, &shutdown).await;
            self.metrics.record_job(
                std::time::Duration::from_secs_f64(outcome.execution_time),
                outcome.status,
            );

            match outcome.status {
                JobStatus::Completed => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id = self.id, request_id = %job.request_id, "job completed");
                }
                _ => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(worker_id = self.id, request_id = %job.request_id, status = %outcome.status, "job did not complete");
                }
            }

            self.dispatch_webhook_if_configured(&job.request_id).await;
        }

        info!(worker_id = self.id, "worker stopped");
    }

    /// Runs the job on its own task so shutdown can race it instead of
    /// blocking the whole worker loop on it. Per §4.3: a job already in
    /// flight gets up to `SHUTDOWN_GRACE_PERIOD` to reach a terminal state
    /// on its own; past that it's forced FAILED with reason `shutdown` and
    /// its task aborted.
    async fn run_with_shutdown_grace(
        &self,
        job: &crate::models::Job,
        handle: crate::browser_pool::BrowserHandle,
        queue_wait: std::time::Duration,
        shutdown: &CancellationToken,
    ) -> ExecutionOutcome {
        let executor = self.executor.clone();
        let job_for_exec = job.clone();
        let mut exec_task = tokio::spawn(async move { executor.run(&job_for_exec, handle, queue_wait).await });

        tokio::select! {
            res = &mut exec_task => self.unwrap_execution(job, res),
            _ = shutdown.cancelled() => {
                warn!(worker_id = self.id, request_id = %job.request_id, "shutdown received mid-execution, waiting grace period");
                match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut exec_task).await {
                    Ok(res) => self.unwrap_execution(job, res),
                    Err(_) => {
                        warn!(worker_id = self.id, request_id = %job.request_id, "grace period elapsed, forcing job failed");
                        exec_task.abort();
                        if let Err(e) = self
                            .store
                            .mark_terminal(&job.request_id, JobStatus::Failed, 0.0, None, None, None, None, None, Some("shutdown"))
                            .await
                        {
                            error!(request_id = %job.request_id, error = %e, "failed to write forced shutdown terminal state");
                        }
                        ExecutionOutcome {
                            status: JobStatus::Failed,
                            error_message: Some("shutdown".to_string()),
                            ..Default::default()
                        }
                    }
                }
            }
        }
    }

    fn unwrap_execution(
        &self,
        job: &crate::models::Job,
        res: Result<ExecutionOutcome, tokio::task::JoinError>,
    ) -> ExecutionOutcome {
        res.unwrap_or_else(|e| {
            error!(worker_id = self.id, request_id = %job.request_id, error = %e, "execution task panicked");
            ExecutionOutcome {
                status: JobStatus::Failed,
                error_message: Some(format!("execution task panicked: {e}")),
                ..Default::default()
            }
        })
    }

    async fn dispatch_webhook_if_configured(&self, request_id: &str) {
        let job = match self.store.get_job(request_id).await {
            Ok(Some(job)) => job,
            _ => return,
        };
        let Some(url) = job.webhook_url.clone() else {
            return;
        };
        let video_url = job
            .video_path
            .as_ref()
            .map(|_| format!("/video/{}/info", job.request_id));
        let payload = build_payload("job.finished", &job, video_url);
        self.webhooks.dispatch(url, payload).await;
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Owns the fixed-size pool of worker tasks. Spawned once at server
/// startup; `shutdown` propagates the root cancellation token so workers
/// stop pulling new jobs once the server is draining.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
}

impl WorkerPool {
    pub fn spawn(
        worker_count: usize,
        queue: Arc<PriorityQueue>,
        browser_pool: Arc<BrowserPool>,
        executor: Arc<Executor>,
        store: Arc<JobStore>,
        webhooks: Arc<WebhookDispatcher>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let worker = Arc::new(Worker::new(
                id,
                queue.clone(),
                browser_pool.clone(),
                executor.clone(),
                store.clone(),
                webhooks.clone(),
                metrics.clone(),
            ));
            let worker_clone = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_clone.run(shutdown).await;
            });
            workers.push(worker);
        }

        info!(count = worker_count, "worker pool started");
        Self { workers }
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.get_stats().processed_count).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.get_stats().error_count).sum()
    }
}
