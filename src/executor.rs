//! Runs one job to completion: RUNNING transition, restricted script
//! evaluation, recording, resource accounting, terminal write.
//!
//! Grounded on the teacher's `screenshot_service.rs` (`capture_screenshot_with_timeout`'s
//! acquire/timeout/release shape) generalized from "take a screenshot" to
//! "run a user script against a recording context," and on
//! `original_source/app/executor.py`'s `PlaywrightExecutor.execute_script`
//! (the RUNNING transition, the restricted namespace, best-effort video
//! save even when the script fails).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::browser_pool::{BrowserHandle, BrowserPool};
use crate::config::Config;
use crate::error::CircuitBreakerTable;
use crate::models::{ExecutionOutcome, Job, JobStatus};
use crate::recorder::Recorder;
use crate::scripting::{build_engine, PageHandle};
use crate::store::JobStore;
use crate::video::VideoStore;

/// `sha256(script)` hex digest. Computed once at submission time and
/// stored as `Job.script_hash`; the Executor reuses it as the circuit
/// breaker key rather than recomputing it.
pub fn compute_fingerprint(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}

/// The page, its in-progress recorder, and a cancellation token for the
/// blocking script thread, published by `run_inner` before the script
/// starts so `finish_with_timeout` can reach into the same job from the
/// timeout branch instead of a page it has no handle to.
struct InFlight {
    page: Arc<chromiumoxide::Page>,
    recorder: Option<Recorder>,
    dest_path: PathBuf,
    cancel: CancellationToken,
}

type InFlightSlot = Arc<AsyncMutex<Option<InFlight>>>;

pub struct Executor {
    store: Arc<JobStore>,
    videos: Arc<VideoStore>,
    browser_pool: Arc<BrowserPool>,
    breakers: CircuitBreakerTable,
    max_execution_time: Duration,
    video_width: u32,
    video_height: u32,
}

impl Executor {
    pub fn new(
        store: Arc<JobStore>,
        videos: Arc<VideoStore>,
        browser_pool: Arc<BrowserPool>,
        breakers: CircuitBreakerTable,
        config: &Config,
    ) -> Self {
        Self {
            store,
            videos,
            browser_pool,
            breakers,
            max_execution_time: Duration::from_secs(config.max_execution_time),
            video_width: config.video_width,
            video_height: config.video_height,
        }
    }

    /// Runs `job`, already leased a browser for it via `handle`. Writes
    /// RUNNING and the terminal state to the Job Store itself (steps 1 and
    /// 9 of §4.5); the caller is only responsible for dequeuing, leasing,
    /// and dispatching the resulting webhook.
    pub async fn run(&self, job: &Job, handle: BrowserHandle, queue_wait: Duration) -> ExecutionOutcome {
        if let Err(e) = self.store.mark_running(&job.request_id, queue_wait.as_secs_f64()).await {
            error!(request_id = %job.request_id, error = %e, "failed to mark job running");
        }

        let start = Instant::now();
        let baseline_rss = current_rss_bytes();
        let baseline_cpu = current_cpu_time_ms();

        let effective_timeout = Duration::from_secs(job.timeout.max(0) as u64).min(self.max_execution_time);

        let inflight: InFlightSlot = Arc::new(AsyncMutex::new(None));

        let outcome = match tokio::time::timeout(
            effective_timeout,
            self.run_inner(job, &handle, baseline_rss, baseline_cpu, start, inflight.clone()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(request_id = %job.request_id, "execution timed out");
                self.finish_with_timeout(job, start, inflight).await
            }
        };

        match outcome.status {
            JobStatus::Completed => self.breakers.record_success(&job.script_hash),
            JobStatus::Failed | JobStatus::TimedOut => {
                self.breakers.record_failure(&job.script_hash);
            }
            _ => {}
        }

        if let Err(e) = self
            .store
            .mark_terminal(
                &job.request_id,
                outcome.status,
                outcome.execution_time,
                outcome.memory_peak_mb,
                outcome.cpu_time_ms,
                outcome.video_path.as_deref(),
                outcome.video_size_mb,
                outcome.result.as_ref(),
                outcome.error_message.as_deref(),
            )
            .await
        {
            error!(request_id = %job.request_id, error = %e, "failed to write terminal state");
        }

        // `handle` drops here, returning the browser to the pool (step 10).
        outcome
    }

    async fn run_inner(
        &self,
        job: &Job,
        handle: &BrowserHandle,
        baseline_rss: Option<u64>,
        baseline_cpu: Option<u64>,
        start: Instant,
        inflight: InFlightSlot,
    ) -> ExecutionOutcome {
        let page = {
            let browser = handle.browser.lock().await;
            match browser.new_page("about:blank").await {
                Ok(page) => Arc::new(page),
                Err(e) => {
                    self.browser_pool.report_failure(handle.instance_id).await;
                    return ExecutionOutcome {
                        status: JobStatus::Failed,
                        execution_time: start.elapsed().as_secs_f64(),
                        queue_wait_time: 0.0,
                        error_message: Some(format!("failed to open page: {e}")),
                        ..Default::default()
                    };
                }
            }
        };

        if let Some(ua) = &job.user_agent {
            let _ = page
                .execute(
                    chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams::new(
                        ua.clone(),
                    ),
                )
                .await;
        }

        let captured_at = chrono::Utc::now();
        let dest_path = self.videos.path_for(&job.request_id, captured_at);
        let frame_dir = std::env::temp_dir().join(format!("webas-frames-{}", job.request_id));
        let _ = tokio::fs::create_dir_all(&frame_dir).await;
        let _ = self.videos.ensure_parent_dir(&dest_path).await;

        let recorder = Recorder::start(page.clone(), frame_dir).await.ok();
        let cancel = CancellationToken::new();

        *inflight.lock().await = Some(InFlight {
            page: page.clone(),
            recorder,
            dest_path: dest_path.clone(),
            cancel: cancel.clone(),
        });

        let run_result = self.run_script(job, page.clone(), cancel).await;

        // Reaching here means the timeout never fired, so the slot is still
        // ours to take; `finish_with_timeout` only ever sees it if we didn't.
        let (video_path, video_size_mb) = match inflight.lock().await.take() {
            Some(in_flight) => self.finalize_recording(job, in_flight, start).await,
            None => (None, None),
        };

        let _ = page.close().await;

        let execution_time = start.elapsed().as_secs_f64();
        let memory_peak_mb = current_rss_bytes()
            .zip(baseline_rss)
            .map(|(now, base)| now.saturating_sub(base) as f64 / 1024.0 / 1024.0);
        let cpu_time_ms = current_cpu_time_ms()
            .zip(baseline_cpu)
            .map(|(now, base)| now.saturating_sub(base) as f64);

        match run_result {
            Ok(value) => ExecutionOutcome {
                status: JobStatus::Completed,
                execution_time,
                queue_wait_time: 0.0,
                memory_peak_mb,
                cpu_time_ms,
                video_path,
                video_size_mb,
                result: Some(value),
                error_message: None,
            },
            Err(message) => ExecutionOutcome {
                status: JobStatus::Failed,
                execution_time,
                queue_wait_time: 0.0,
                memory_peak_mb,
                cpu_time_ms,
                video_path,
                video_size_mb,
                result: None,
                error_message: Some(message),
            },
        }
    }

    /// Evaluates the script's `main` on a blocking thread, bridging into
    /// the async `page` API through `PageHandle`. Per §4.5 step 5/6: a
    /// synchronous bridge under `spawn_blocking`, not a direct async call.
    /// `cancel` is handed to the engine and to `PageHandle` so a timeout
    /// actually stops the thread instead of merely abandoning its
    /// `JoinHandle` (`spawn_blocking` tasks run to completion regardless of
    /// whether anyone still awaits them).
    async fn run_script(
        &self,
        job: &Job,
        page: Arc<chromiumoxide::Page>,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, String> {
        let script = job.script.clone();
        let runtime = tokio::runtime::Handle::current();

        let join_result = tokio::task::spawn_blocking(move || {
            let engine = build_engine(cancel.clone());
            let ast = engine.compile(&script).map_err(|e| format!("compile error: {e}"))?;
            let page_handle = PageHandle::new(page, runtime, cancel);

            let mut scope = rhai::Scope::new();
            scope.push("page", page_handle);

            let result: rhai::Dynamic = engine
                .call_fn::<rhai::Dynamic>(&mut scope, &ast, "main", ())
                .map_err(|e| e.to_string())?;

            rhai_to_serde(result)
        })
        .await;

        match join_result {
            Ok(inner) => inner,
            Err(e) => Err(format!("script execution panicked: {e}")),
        }
    }

    /// Stops the screencast and muxes whatever was captured, recording the
    /// result in the video store's info cache alongside the Job Store write
    /// `run`/`finish_with_timeout` perform next. Shared by the normal and
    /// timeout paths so a partial recording is never dropped silently.
    async fn finalize_recording(
        &self,
        job: &Job,
        in_flight: InFlight,
        start: Instant,
    ) -> (Option<String>, Option<f64>) {
        let Some(recorder) = in_flight.recorder else {
            return (None, None);
        };
        match recorder.finalize(&in_flight.dest_path).await {
            Some(bytes) => {
                let size_mb = bytes as f64 / 1024.0 / 1024.0;
                self.videos
                    .save_video_info(&job.request_id, &in_flight.dest_path, start.elapsed().as_secs_f64())
                    .await;
                (Some(in_flight.dest_path.to_string_lossy().to_string()), Some(size_mb))
            }
            None => (None, None),
        }
    }

    /// Reached when `run_inner`'s future was dropped mid-flight by
    /// `tokio::time::timeout`. Takes over the in-progress page/recorder it
    /// published before starting the script, closes the context so the
    /// recording flushes, and persists whatever partial artifact resulted
    /// instead of reporting an unconditional `video_path: None`.
    async fn finish_with_timeout(&self, job: &Job, start: Instant, inflight: InFlightSlot) -> ExecutionOutcome {
        let (video_path, video_size_mb) = match inflight.lock().await.take() {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                let page = in_flight.page.clone();
                let result = self.finalize_recording(job, in_flight, start).await;
                let _ = page.close().await;
                result
            }
            None => (None, None),
        };

        warn!(request_id = %job.request_id, "finalizing job as timed out");
        ExecutionOutcome {
            status: JobStatus::TimedOut,
            execution_time: start.elapsed().as_secs_f64(),
            queue_wait_time: 0.0,
            video_path,
            video_size_mb,
            error_message: Some("execution exceeded its timeout".to_string()),
            ..Default::default()
        }
    }
}

/// Converts a Rhai return value to a `serde_json::Value` via the inverse
/// of `rhai::serde::to_dynamic`. Per §4.5's result-marshaling rule, a value
/// Rhai can't express as JSON (e.g. a function pointer or shared closure)
/// fails the job with `unmarshalable result` rather than silently becoming
/// `null`.
fn rhai_to_serde(value: rhai::Dynamic) -> Result<serde_json::Value, String> {
    rhai::serde::from_dynamic(&value).map_err(|_| "unmarshalable result".to_string())
}

fn current_rss_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Sums user+system CPU jiffies from `/proc/self/stat` and converts to
/// milliseconds assuming the common 100 Hz `CLOCK_TICKS_PER_SEC`.
fn current_cpu_time_ms() -> Option<u64> {
    const CLOCK_TICKS_PER_SEC: u64 = 100;
    let content = std::fs::read_to_string("/proc/self/stat").ok()?;
    let after_comm = content.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime and stime are fields 14 and 15 (1-indexed) of the whole line;
    // relative to the fields after the comm field, that's index 11 and 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1000 / CLOCK_TICKS_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = compute_fingerprint("fn main() { 1 }");
        let b = compute_fingerprint("fn main() { 1 }");
        let c = compute_fingerprint("fn main() { 2 }");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cpu_time_reads_something_on_linux() {
        // Best-effort: just confirm it parses without panicking.
        let _ = current_cpu_time_ms();
        let _ = current_rss_bytes();
    }
}
