//! Browser pool: a fixed-size set of warm, health-checked Chrome instances.
//!
//! Kept close to the teacher's `browser_pool.rs` — `BrowserInstance`,
//! `BrowserHandle` (the RAII Acquire/Release pairing via `Drop`), the
//! staggered-startup + periodic health-check task. Differences: `Acquire`
//! now has an explicit timeout (the teacher relied on the semaphore's
//! `acquire().await` blocking indefinitely), instances track a warm-up flag
//! instead of a screenshot counter, and the config-to-launch-args bridge
//! lives here instead of in `config.rs` since it no longer needs to be
//! shared with a screenshot-specific call site.

use crate::config::Config;
use crate::error::CoreError;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Healthy,
    Busy,
    Unresponsive,
    Restarting,
    Failed,
}

#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    pub handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    pub last_used: Instant,
    pub jobs_executed: usize,
    pub status: InstanceStatus,
    pub created_at: Instant,
    pub failure_count: usize,
    pub warmed: bool,
}

impl BrowserInstance {
    pub fn new(
        id: usize,
        browser: Browser,
        handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    ) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            last_used: Instant::now(),
            jobs_executed: 0,
            status: InstanceStatus::Healthy,
            created_at: Instant::now(),
            failure_count: 0,
            warmed: false,
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.jobs_executed += 1;
        self.status = InstanceStatus::Busy;
    }

    pub fn mark_available(&mut self) {
        self.status = InstanceStatus::Healthy;
    }

    pub fn mark_failed(&mut self) {
        self.failure_count += 1;
        self.status = InstanceStatus::Failed;
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, InstanceStatus::Healthy)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// A leased browser. Dropping this — on any exit path, including a panic
/// unwind or task cancellation — returns the instance to the pool. This is
/// the scoped-acquisition pattern §4.4 requires to keep Acquire/Release
/// paired.
pub struct BrowserHandle {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: Arc<BrowserPool>,
}

impl BrowserHandle {
    fn new(browser: Arc<Mutex<Browser>>, instance_id: usize, pool: Arc<BrowserPool>) -> Self {
        Self {
            browser,
            instance_id,
            pool,
        }
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            pool.return_browser(instance_id).await;
        });
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    config: Config,
    is_shutting_down: Arc<std::sync::atomic::AtomicBool>,
    acquire_timeout: Duration,
}

fn build_browser_config(config: &Config, instance_id: usize) -> Result<BrowserConfig, CoreError> {
    let mut builder = BrowserConfig::builder()
        .args(config.chrome_args(instance_id))
        .window_size(config.video_width as u32, config.video_height as u32);
    if let Some(path) = &config.chrome_path {
        builder = builder.chrome_executable(path);
    }
    builder
        .build()
        .map_err(|e| CoreError::BrowserUnavailable(e.to_string()))
}

impl BrowserPool {
    pub async fn new(config: Config) -> Result<Self, CoreError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(config.browser_pool_size)),
            config: config.clone(),
            is_shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            acquire_timeout: Duration::from_secs(30),
        };

        pool.initialize_instances().await?;
        pool.warm_up().await;
        pool.start_health_check_task().await;

        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), CoreError> {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        for i in 0..self.config.browser_pool_size {
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            match self.create_browser_instance(i).await {
                Ok(instance) => {
                    instances.push(instance);
                    available.push_back(i);
                    info!(instance_id = i, "browser instance created");
                }
                Err(e) => {
                    error!(instance_id = i, error = %e, "failed to create browser instance");
                    return Err(e);
                }
            }
        }

        info!(count = instances.len(), "browser pool initialized");
        Ok(())
    }

    /// Opens `browser_warmup_pages` contexts against `about:blank`, per
    /// §4.4, and marks those instances as warm so `/health` can report an
    /// accurate "warm browser" count rather than merely "process spawned"
    /// (the resolved Open Question in SPEC_FULL §9).
    async fn warm_up(&self) {
        let count = self.config.browser_warmup_pages.min(self.config.browser_pool_size);
        let mut instances = self.instances.lock().await;
        for instance in instances.iter_mut().take(count) {
            let browser = instance.browser.clone();
            let opened = browser.lock().await.new_page("about:blank").await;
            match opened {
                Ok(_) => instance.warmed = true,
                Err(e) => warn!(instance_id = instance.id, error = %e, "warm-up page failed"),
            }
        }
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, CoreError> {
        let temp_dir = format!("/tmp/webas-chromium-{}-{}", std::process::id(), id);
        let runner_dir = format!("/tmp/webas-runner-{}", id);
        std::fs::create_dir_all(&temp_dir)?;
        std::fs::create_dir_all(&runner_dir)?;

        let instance_config = build_browser_config(&self.config, id)?;

        let (browser, mut handler) = {
            std::env::set_var("TMPDIR", &runner_dir);
            let result = Browser::launch(instance_config).await;
            std::env::remove_var("TMPDIR");
            result
        }
        .map_err(|e| CoreError::BrowserUnavailable(e.to_string()))?;

        // The CDP handler implements Stream and must be polled continuously
        // or no events (navigation, screenshots, ...) ever complete.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        tracing::info!("handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    /// Blocks (up to `acquire_timeout`) until a healthy browser is free.
    pub async fn get_browser(self: &Arc<Self>) -> Result<BrowserHandle, CoreError> {
        if self.is_shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CoreError::BrowserUnavailable("pool is shutting down".into()));
        }

        let acquire = async {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|e| CoreError::BrowserUnavailable(e.to_string()))?;

            for attempt in 0..3 {
                let instance_id = {
                    let mut available = self.available.lock().await;
                    match available.pop_front() {
                        Some(id) => id,
                        None => continue,
                    }
                };

                let browser_result = {
                    let mut instances = self.instances.lock().await;
                    let instance = instances
                        .get_mut(instance_id)
                        .ok_or_else(|| CoreError::BrowserUnavailable("instance vanished".into()))?;

                    let healthy = instance.is_healthy() && !instance.handler.is_finished();
                    if !healthy {
                        warn!(instance_id, attempt, "instance unhealthy, restarting");
                        match self.restart_instance_internal(instance_id).await {
                            Ok(()) => {
                                instance.mark_used();
                                Ok(instance.browser.clone())
                            }
                            Err(e) => {
                                self.available.lock().await.push_back(instance_id);
                                Err(e)
                            }
                        }
                    } else {
                        instance.mark_used();
                        Ok(instance.browser.clone())
                    }
                };

                match browser_result {
                    Ok(browser) => return Ok((browser, instance_id)),
                    Err(_) if attempt < 2 => continue,
                    Err(e) => return Err(e),
                }
            }

            Err(CoreError::BrowserUnavailable("no healthy instance found".into()))
        };

        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(Ok((browser, instance_id))) => Ok(BrowserHandle::new(browser, instance_id, self.clone())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::BrowserUnavailable("acquire timed out".into())),
        }
    }

    /// Releases a leased instance back to the pool, per §4.4's `Release(b)`:
    /// only a liveness-passing instance is requeued, otherwise it's closed
    /// and replaced so a job that left its browser in a bad state (a
    /// crashed handler, a context it never tore down) can't be handed
    /// straight to the next job.
    pub async fn return_browser(&self, instance_id: usize) {
        let healthy = {
            let instances = self.instances.lock().await;
            instances
                .get(instance_id)
                .map(|instance| instance.is_healthy() && !instance.handler.is_finished())
                .unwrap_or(false)
        };

        if healthy {
            let mut instances = self.instances.lock().await;
            if let Some(instance) = instances.get_mut(instance_id) {
                instance.mark_available();
            }
            self.available.lock().await.push_back(instance_id);
            return;
        }

        warn!(instance_id, "released instance failed liveness check, restarting");
        if let Err(e) = self.restart_instance_internal(instance_id).await {
            error!(instance_id, error = %e, "failed to restart unhealthy instance on release");
        }
        self.available.lock().await.push_back(instance_id);
    }

    /// Marks an instance failed without restarting it inline; the next
    /// `get_browser` call (or the health-check task) restarts it.
    pub async fn report_failure(&self, instance_id: usize) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.mark_failed();
        }
    }

    pub async fn health_check(&self) -> Vec<InstanceHealth> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .map(|instance| InstanceHealth {
                id: instance.id,
                status: instance.status,
                jobs_executed: instance.jobs_executed,
                age: instance.age(),
                idle_time: instance.idle_time(),
                failure_count: instance.failure_count,
                warmed: instance.warmed,
            })
            .collect()
    }

    pub async fn restart_instance(&self, instance_id: usize) -> Result<(), CoreError> {
        self.restart_instance_internal(instance_id).await
    }

    async fn restart_instance_internal(&self, instance_id: usize) -> Result<(), CoreError> {
        let mut instances = self.instances.lock().await;

        if let Some(instance) = instances.get_mut(instance_id) {
            instance.status = InstanceStatus::Restarting;
            let _ = instance.browser.lock().await.close().await;
            instance.handler.abort();

            match self.create_browser_instance(instance_id).await {
                Ok(new_instance) => {
                    *instance = new_instance;
                    info!(instance_id, "browser instance restarted");
                    Ok(())
                }
                Err(e) => {
                    instance.status = InstanceStatus::Failed;
                    error!(instance_id, error = %e, "failed to restart browser instance");
                    Err(e)
                }
            }
        } else {
            Err(CoreError::BrowserUnavailable("unknown instance".into()))
        }
    }

    async fn start_health_check_task(&self) {
        let instances = self.instances.clone();
        let available = self.available.clone();
        let semaphore = self.semaphore.clone();
        let config = self.config.clone();
        let is_shutting_down = self.is_shutting_down.clone();

        // Rebuild a lightweight handle to `self` for the spawned task by
        // reconstructing the pool's shared state rather than requiring
        // `Arc<Self>` at construction time (callers hold `Arc<BrowserPool>`
        // once `new` returns and wrap it themselves).
        let pool_for_task = Arc::new(Self {
            instances,
            available,
            semaphore,
            config,
            is_shutting_down: is_shutting_down.clone(),
            acquire_timeout: self.acquire_timeout,
        });

        tokio::spawn(async move {
            let mut quick_interval = tokio::time::interval(Duration::from_secs(15));
            let mut deep_interval = tokio::time::interval(Duration::from_secs(60));

            while !is_shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
                tokio::select! {
                    _ = quick_interval.tick() => {
                        pool_for_task.quick_health_check().await;
                    }
                    _ = deep_interval.tick() => {
                        pool_for_task.deep_health_check().await;
                    }
                }
            }
        });
    }

    async fn quick_health_check(&self) {
        let instances = self.instances.lock().await;
        for instance in instances.iter() {
            if instance.handler.is_finished() {
                warn!(instance_id = instance.id, "handler crashed, will restart on next acquire");
            }
            if instance.idle_time() > Duration::from_secs(300) && instance.status == InstanceStatus::Busy {
                warn!(instance_id = instance.id, idle_secs = instance.idle_time().as_secs(), "instance unresponsive");
            }
        }
    }

    async fn deep_health_check(&self) {
        let to_restart: Vec<usize> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .filter(|instance| {
                    instance.age() > Duration::from_secs(3600)
                        || instance.failure_count > 10
                        || instance.handler.is_finished()
                        || (instance.idle_time() > Duration::from_secs(600) && instance.status == InstanceStatus::Busy)
                })
                .map(|instance| instance.id)
                .collect()
        };

        for instance_id in to_restart {
            if let Err(e) = self.restart_instance(instance_id).await {
                error!(instance_id, error = %e, "failed to restart during health check");
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.is_shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);

        let mut retries = 0;
        while retries < 10 {
            let available_count = self.available.lock().await.len();
            if available_count == self.config.browser_pool_size {
                break;
            }
            sleep(Duration::from_millis(100)).await;
            retries += 1;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }

        info!("browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let available = self.available.lock().await;

        let mut healthy = 0;
        let mut busy = 0;
        let mut failed = 0;
        let mut warm = 0;
        let mut total_jobs = 0;

        for instance in instances.iter() {
            total_jobs += instance.jobs_executed;
            if instance.warmed {
                warm += 1;
            }
            match instance.status {
                InstanceStatus::Healthy => healthy += 1,
                InstanceStatus::Busy => busy += 1,
                InstanceStatus::Failed => failed += 1,
                _ => {}
            }
        }

        BrowserPoolStats {
            total_instances: instances.len(),
            healthy_instances: healthy,
            busy_instances: busy,
            failed_instances: failed,
            available_instances: available.len(),
            warm_instances: warm,
            total_jobs_executed: total_jobs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub id: usize,
    pub status: InstanceStatus,
    pub jobs_executed: usize,
    pub age: Duration,
    pub idle_time: Duration,
    pub failure_count: usize,
    pub warmed: bool,
}

#[derive(Debug, Clone)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub available_instances: usize,
    pub warm_instances: usize,
    pub total_jobs_executed: usize,
}
