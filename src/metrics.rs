use metrics::{Counter, Gauge, Histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Process-wide counters/gauges for §8. Field names track job-execution
/// concepts now; the shape (one `Counter`/`Gauge`/`Histogram` per concern,
/// a `record_*`/`set_*` method each) is unchanged from the teacher.
pub struct Metrics {
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_timed_out: Counter,
    pub job_duration: Histogram,
    pub browser_pool_utilization: Gauge,
    pub memory_usage: Gauge,
    pub error_count: Counter,
    pub queue_size: Gauge,
    pub active_executions: Gauge,
    pub browser_restarts: Counter,
    pub webhook_deliveries: Counter,
    pub webhook_failures: Counter,
    pub circuit_breaker_trips: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_completed: Counter::noop(),
            jobs_failed: Counter::noop(),
            jobs_timed_out: Counter::noop(),
            job_duration: Histogram::noop(),
            browser_pool_utilization: Gauge::noop(),
            memory_usage: Gauge::noop(),
            error_count: Counter::noop(),
            queue_size: Gauge::noop(),
            active_executions: Gauge::noop(),
            browser_restarts: Counter::noop(),
            webhook_deliveries: Counter::noop(),
            webhook_failures: Counter::noop(),
            circuit_breaker_trips: Counter::noop(),
        }
    }

    pub fn record_job(&self, duration: Duration, status: crate::models::JobStatus) {
        match status {
            crate::models::JobStatus::Completed => self.jobs_completed.increment(1),
            crate::models::JobStatus::TimedOut => self.jobs_timed_out.increment(1),
            crate::models::JobStatus::Failed => self.jobs_failed.increment(1),
            _ => {}
        }
        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn record_browser_usage(&self, active_instances: usize, total_instances: usize) {
        let utilization = (active_instances as f64 / total_instances.max(1) as f64) * 100.0;
        self.browser_pool_utilization.set(utilization);
    }

    pub fn record_memory_usage(&self, bytes: usize) {
        self.memory_usage.set(bytes as f64);
    }

    pub fn record_error(&self) {
        self.error_count.increment(1);
    }

    pub fn record_webhook_delivery(&self, success: bool) {
        if success {
            self.webhook_deliveries.increment(1);
        } else {
            self.webhook_failures.increment(1);
        }
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.increment(1);
    }

    pub fn record_browser_restart(&self) {
        self.browser_restarts.increment(1);
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.set(size as f64);
    }

    pub fn set_active_executions(&self, count: usize) {
        self.active_executions.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    start_time: Instant,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            start_time: Instant::now(),
            collection_interval: Duration::from_secs(10),
        }
    }
    
    pub async fn start_collection(&self) {
        let metrics = self.metrics.clone();
        let interval = self.collection_interval;
        
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            
            loop {
                interval_timer.tick().await;
                
                // Collect system metrics
                if let Ok(memory) = Self::get_memory_usage() {
                    metrics.record_memory_usage(memory);
                }
                
                // Log metrics summary
                info!("Metrics collection completed");
            }
        });
    }
    
    fn get_memory_usage() -> Result<usize, Box<dyn std::error::Error>> {
        // This is a simplified memory usage calculation
        // In a real implementation, you'd use system APIs or crates like `sysinfo`
        let _pid = std::process::id();
        
        // Try to read from /proc/self/status (Linux)
        if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
            for line in content.lines() {
                if line.starts_with("VmRSS:") {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() >= 2 {
                        if let Ok(kb) = parts[1].parse::<usize>() {
                            return Ok(kb * 1024); // Convert KB to bytes
                        }
                    }
                }
            }
        }
        
        Ok(0) // Fallback if we can't read memory usage
    }
    
    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Installs the process-wide Prometheus recorder and keeps the
/// `PrometheusHandle` needed to render text exposition on demand. The
/// teacher's `start()` built a recorder, installed it, then discarded it —
/// leaving nothing to serve `/metrics` from. Here the handle is served
/// directly by the axum router's `/metrics` route instead of a second
/// listener, closing that gap.
pub struct PrometheusExporter {
    handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl PrometheusExporter {
    pub fn install() -> Result<Self, metrics_exporter_prometheus::BuildError> {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus recorder installed");
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_avg_duration: Duration,
    pub max_error_rate: f64,
    pub max_memory_usage: usize,
    pub min_available_browsers: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_avg_duration: Duration::from_secs(30),
            max_error_rate: 0.05, // 5%
            max_memory_usage: 1024 * 1024 * 1024, // 1GB
            min_available_browsers: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub performance: HealthLevel,
    pub resources: HealthLevel,
    pub errors: HealthLevel,
    pub timestamp: std::time::SystemTime,
}