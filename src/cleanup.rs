//! Daily retention sweep: old videos, old execution rows, idle circuit
//! breakers, `VACUUM`. Grounded on `original_source/app/cleanup.py`'s
//! `CleanupService` — the `schedule`-library daily-at-hour job and the
//! one-minute worker loop are replaced with a single `tokio::time::interval`
//! loop in the teacher's `HealthMonitor::start_monitoring` shape
//! (`src/health.rs`), since there's no need for a second scheduling crate
//! once everything already runs under tokio.

use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use tracing::{error, info};

use crate::config::Config;
use crate::error::CircuitBreakerTable;
use crate::store::JobStore;
use crate::video::VideoStore;

pub struct CleanupScheduler {
    store: Arc<JobStore>,
    videos: Arc<VideoStore>,
    breakers: CircuitBreakerTable,
    video_retention_days: i64,
    cleanup_hour: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub videos_deleted: u64,
    pub video_bytes_freed_mb: f64,
    pub executions_deleted: u64,
    pub circuit_breakers_reaped: bool,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<JobStore>,
        videos: Arc<VideoStore>,
        breakers: CircuitBreakerTable,
        config: &Config,
    ) -> Self {
        Self {
            store,
            videos,
            breakers,
            video_retention_days: config.video_retention_days,
            cleanup_hour: config.video_cleanup_hour,
        }
    }

    /// One full sweep: expired videos, stale execution rows (kept twice as
    /// long as videos, floor 30 days, per the original's separate
    /// `cleanup_old_executions` default), idle breaker entries, then a
    /// `VACUUM` to reclaim the freed pages.
    pub async fn run_once(&self) -> CleanupReport {
        info!("running cleanup sweep");
        let mut report = CleanupReport::default();

        let video_outcome = self.videos.cleanup_old_videos(self.video_retention_days).await;
        report.videos_deleted = video_outcome.deleted_count;
        report.video_bytes_freed_mb = video_outcome.deleted_size_mb;
        for err in &video_outcome.errors {
            error!(error = %err, "video cleanup error");
        }
        for request_id in &video_outcome.deleted_request_ids {
            if let Err(e) = self.store.clear_video_path(request_id).await {
                error!(request_id, error = %e, "failed to clear video_path after deletion");
            }
        }

        let execution_retention_days = (self.video_retention_days * 2).max(30);
        match self.store.delete_old_jobs(execution_retention_days).await {
            Ok(deleted) => report.executions_deleted = deleted,
            Err(e) => error!(error = %e, "failed to delete old execution rows"),
        }

        self.breakers.reap_idle();
        report.circuit_breakers_reaped = true;

        let today = chrono::Utc::now();
        let day_start = today
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let day_end = day_start + chrono::Duration::days(1);
        match self.store.daily_stat_totals(day_start, day_end).await {
            Ok((total, successful, failed, avg_execution_time, total_video_size_mb)) => {
                if let Err(e) = self
                    .store
                    .upsert_daily_stat(
                        &day_start.format("%Y-%m-%d").to_string(),
                        total,
                        successful,
                        failed,
                        avg_execution_time,
                        total_video_size_mb,
                    )
                    .await
                {
                    error!(error = %e, "failed to upsert daily stat rollup");
                }
            }
            Err(e) => error!(error = %e, "failed to aggregate daily stat totals"),
        }

        if let Err(e) = self.store.vacuum().await {
            error!(error = %e, "vacuum failed");
        }

        info!(
            videos_deleted = report.videos_deleted,
            video_bytes_freed_mb = report.video_bytes_freed_mb,
            executions_deleted = report.executions_deleted,
            "cleanup sweep completed"
        );
        report
    }

    /// Runs `run_once` once a day, at `cleanup_hour` local-to-process time
    /// (the process is expected to run in UTC, matching `video_cleanup_hour`'s
    /// documented semantics). Ticks every minute and only fires the sweep on
    /// the minute it crosses into the target hour, so a restart at any time
    /// of day still catches the next occurrence without drifting.
    pub async fn spawn(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            let mut last_run_date: Option<chrono::NaiveDate> = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("cleanup scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now();
                        let due = now.hour() == self.cleanup_hour
                            && last_run_date != Some(now.date_naive());
                        if due {
                            last_run_date = Some(now.date_naive());
                            self.run_once().await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scheduler() -> CleanupScheduler {
        let store = Arc::new(JobStore::in_memory().await.unwrap());
        let dir = std::env::temp_dir().join(format!("webas-cleanup-test-{}", uuid::Uuid::new_v4()));
        let videos = VideoStore::new(dir, 1280, 720);
        videos.initialize().await.unwrap();
        let breakers = CircuitBreakerTable::new(5, Duration::from_secs(60));
        let config = Config::default();
        CleanupScheduler::new(store, videos, breakers, &config)
    }

    #[tokio::test]
    async fn run_once_completes_on_an_empty_store() {
        let scheduler = scheduler().await;
        let report = scheduler.run_once().await;
        assert_eq!(report.videos_deleted, 0);
        assert_eq!(report.executions_deleted, 0);
        assert!(report.circuit_breakers_reaped);
    }

    #[tokio::test]
    async fn execution_retention_floor_is_thirty_days() {
        let mut config = Config::default();
        config.video_retention_days = 2;
        let store = Arc::new(JobStore::in_memory().await.unwrap());
        let dir = std::env::temp_dir().join(format!("webas-cleanup-test-{}", uuid::Uuid::new_v4()));
        let videos = VideoStore::new(dir, 1280, 720);
        videos.initialize().await.unwrap();
        let breakers = CircuitBreakerTable::new(5, Duration::from_secs(60));
        let scheduler = CleanupScheduler::new(store, videos, breakers, &config);
        assert_eq!((scheduler.video_retention_days * 2).max(30), 30);
    }
}
