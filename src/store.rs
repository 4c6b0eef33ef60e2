//! Durable job state, backed by SQLite via `sqlx`. Schema matches §6:
//! `api_keys` and `executions` (named `Job` in this crate), plus the
//! supplemental `daily_stats` and `script_templates` tables carried over
//! from the original implementation's `database.py`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::CoreError;
use crate::models::{ApiKey, DailyStat, Job, JobStatus};

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_value TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    rate_limit_per_minute INTEGER NOT NULL DEFAULT 60,
    total_requests INTEGER NOT NULL DEFAULT 0,
    scopes TEXT NOT NULL DEFAULT 'execute',
    expires_at TEXT,
    webhook_url TEXT,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS executions (
    request_id TEXT UNIQUE NOT NULL,
    api_key_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    script_hash TEXT NOT NULL,
    script_size INTEGER NOT NULL,
    script TEXT NOT NULL,
    execution_time REAL,
    queue_wait_time REAL,
    video_path TEXT,
    video_size_mb REAL,
    memory_peak_mb REAL,
    cpu_time_ms REAL,
    error_message TEXT,
    result TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    priority INTEGER NOT NULL,
    timeout INTEGER NOT NULL,
    webhook_url TEXT,
    user_agent TEXT,
    webhook_status TEXT
);

CREATE INDEX IF NOT EXISTS idx_executions_status_priority
    ON executions (status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_executions_api_key
    ON executions (api_key_id, created_at DESC);

CREATE TABLE IF NOT EXISTS daily_stats (
    date TEXT UNIQUE NOT NULL,
    total_executions INTEGER NOT NULL DEFAULT 0,
    successful_executions INTEGER NOT NULL DEFAULT 0,
    failed_executions INTEGER NOT NULL DEFAULT 0,
    avg_execution_time REAL NOT NULL DEFAULT 0,
    total_video_size_mb REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS script_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    script TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0
);
"#;

impl JobStore {
    pub async fn connect(database_path: &str) -> Result<Self, CoreError> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", database_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies `SCHEMA` against `database_path` and returns without leaving
    /// a pool open, for the `migrate` CLI subcommand — an explicit,
    /// operator-triggered counterpart to the implicit `CREATE TABLE IF NOT
    /// EXISTS` that `connect` also runs on every server startup.
    pub async fn migrate(database_path: &str) -> Result<(), CoreError> {
        let store = Self::connect(database_path).await?;
        store.pool.close().await;
        Ok(())
    }

    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert_job(&self, job: &Job) -> Result<(), CoreError> {
        let tags = serde_json::to_string(&job.tags)?;
        sqlx::query(
            r#"INSERT INTO executions
                (request_id, api_key_id, created_at, status, script_hash, script_size, script,
                 tags, priority, timeout, webhook_url, user_agent)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&job.request_id)
        .bind(job.api_key_id)
        .bind(job.created_at.to_rfc3339())
        .bind(job.status.as_str())
        .bind(&job.script_hash)
        .bind(job.script_size)
        .bind(&job.script)
        .bind(tags)
        .bind(job.priority)
        .bind(job.timeout)
        .bind(&job.webhook_url)
        .bind(&job.user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_running(&self, request_id: &str, queue_wait_time: f64) -> Result<(), CoreError> {
        sqlx::query("UPDATE executions SET status = ?, queue_wait_time = ? WHERE request_id = ?")
            .bind(JobStatus::Running.as_str())
            .bind(queue_wait_time)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_terminal(
        &self,
        request_id: &str,
        status: JobStatus,
        execution_time: f64,
        memory_peak_mb: Option<f64>,
        cpu_time_ms: Option<f64>,
        video_path: Option<&str>,
        video_size_mb: Option<f64>,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<(), CoreError> {
        let result_json = result.map(|r| r.to_string());
        sqlx::query(
            r#"UPDATE executions SET
                status = ?, completed_at = ?, execution_time = ?, memory_peak_mb = ?,
                cpu_time_ms = ?, video_path = ?, video_size_mb = ?, result = ?, error_message = ?
               WHERE request_id = ?"#,
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(execution_time)
        .bind(memory_peak_mb)
        .bind(cpu_time_ms)
        .bind(video_path)
        .bind(video_size_mb)
        .bind(result_json)
        .bind(error_message)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_webhook_status(&self, request_id: &str, status: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE executions SET webhook_status = ? WHERE request_id = ?")
            .bind(status)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_video_path(&self, request_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE executions SET video_path = NULL WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_job(&self, request_id: &str) -> Result<Option<Job>, CoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_job(&r)))
    }

    /// Jobs left in QUEUED at startup — recovery sweep per §4.2: if insert
    /// and enqueue are not one transaction, these must be re-enqueued
    /// before new submissions are accepted.
    pub async fn recover_queued_jobs(&self) -> Result<Vec<Job>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE status = ? ORDER BY priority DESC, created_at ASC",
        )
        .bind(JobStatus::Queued.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn find_api_key(&self, key_value: &str) -> Result<Option<ApiKey>, CoreError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_value = ? AND is_active = 1")
            .bind(key_value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_api_key(&r)))
    }

    pub async fn touch_api_key(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE api_keys SET last_used = ?, total_requests = total_requests + 1 WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_api_key(&self, name: &str, key_value: &str, scopes: &str) -> Result<i64, CoreError> {
        let result = sqlx::query(
            "INSERT INTO api_keys (key_value, name, created_at, scopes) VALUES (?, ?, ?, ?)",
        )
        .bind(key_value)
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(scopes)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Mirrors `original_source`'s `ensure_admin_key`: an admin key always
    /// carries the full `execute,videos,admin,dashboard` scope set.
    pub async fn ensure_admin_key(&self, key_value: &str) -> Result<(), CoreError> {
        if self.find_api_key(key_value).await?.is_none() {
            self.create_api_key("admin", key_value, "execute,videos,admin,dashboard")
                .await?;
        }
        Ok(())
    }

    pub async fn queue_counts(&self) -> Result<(i64, i64), CoreError> {
        let queued: i64 = sqlx::query("SELECT COUNT(*) AS c FROM executions WHERE status = ?")
            .bind(JobStatus::Queued.as_str())
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
        let running: i64 = sqlx::query("SELECT COUNT(*) AS c FROM executions WHERE status = ?")
            .bind(JobStatus::Running.as_str())
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
        Ok((queued, running))
    }

    /// Job rows older than `max(30, 2*video_retention_days)` days, per §4.7.
    pub async fn delete_old_jobs(&self, older_than_days: i64) -> Result<u64, CoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let result = sqlx::query("DELETE FROM executions WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn vacuum(&self) -> Result<(), CoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_daily_stat(
        &self,
        date: &str,
        total: i64,
        successful: i64,
        failed: i64,
        avg_execution_time: f64,
        total_video_size_mb: f64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO daily_stats (date, total_executions, successful_executions, failed_executions, avg_execution_time, total_video_size_mb)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(date) DO UPDATE SET
                 total_executions = excluded.total_executions,
                 successful_executions = excluded.successful_executions,
                 failed_executions = excluded.failed_executions,
                 avg_execution_time = excluded.avg_execution_time,
                 total_video_size_mb = excluded.total_video_size_mb"#,
        )
        .bind(date)
        .bind(total)
        .bind(successful)
        .bind(failed)
        .bind(avg_execution_time)
        .bind(total_video_size_mb)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregates `(total, successful, failed, avg_execution_time, total_video_size_mb)`
    /// over executions created on `date` (an RFC3339 day boundary pair), for
    /// the Cleanup Scheduler's opportunistic `daily_stats` rollup.
    pub async fn daily_stat_totals(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<(i64, i64, i64, f64, f64), CoreError> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) AS total,
                 COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) AS successful,
                 COALESCE(SUM(CASE WHEN status IN (?, ?) THEN 1 ELSE 0 END), 0) AS failed,
                 COALESCE(AVG(execution_time), 0.0) AS avg_execution_time,
                 COALESCE(SUM(video_size_mb), 0.0) AS total_video_size_mb
               FROM executions
               WHERE created_at >= ? AND created_at < ?"#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(JobStatus::TimedOut.as_str())
        .bind(day_start.to_rfc3339())
        .bind(day_end.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.try_get("total")?,
            row.try_get("successful")?,
            row.try_get("failed")?,
            row.try_get("avg_execution_time")?,
            row.try_get("total_video_size_mb")?,
        ))
    }

    /// Most recent `daily_stats` row, for `/health`'s one-line trend.
    pub async fn latest_daily_stat(&self) -> Result<Option<DailyStat>, CoreError> {
        let row = sqlx::query(
            "SELECT date, total_executions, successful_executions, failed_executions, avg_execution_time, total_video_size_mb
             FROM daily_stats ORDER BY date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(r) => Some(DailyStat {
                date: r.try_get("date")?,
                total_executions: r.try_get("total_executions")?,
                successful_executions: r.try_get("successful_executions")?,
                failed_executions: r.try_get("failed_executions")?,
                avg_execution_time: r.try_get("avg_execution_time")?,
                total_video_size_mb: r.try_get("total_video_size_mb")?,
            }),
            None => None,
        })
    }

    pub async fn get_template(&self, id: i64) -> Result<Option<String>, CoreError> {
        let row = sqlx::query("SELECT script FROM script_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                sqlx::query("UPDATE script_templates SET usage_count = usage_count + 1 WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(Some(r.try_get("script")?))
            }
            None => Ok(None),
        }
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    let tags_json: String = row.try_get("tags").unwrap_or_else(|_| "[]".to_string());
    let result_json: Option<String> = row.try_get("result").ok();
    Job {
        request_id: row.try_get("request_id").unwrap_or_default(),
        api_key_id: row.try_get("api_key_id").unwrap_or_default(),
        script: row.try_get("script").unwrap_or_default(),
        script_hash: row.try_get("script_hash").unwrap_or_default(),
        script_size: row.try_get("script_size").unwrap_or_default(),
        priority: row.try_get("priority").unwrap_or_default(),
        timeout: row.try_get("timeout").unwrap_or_default(),
        webhook_url: row.try_get("webhook_url").ok(),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        user_agent: row.try_get("user_agent").ok(),
        status: parse_status(row.try_get("status").unwrap_or_default()),
        created_at: parse_timestamp(row.try_get::<String, _>("created_at").unwrap_or_default()),
        completed_at: row
            .try_get::<Option<String>, _>("completed_at")
            .ok()
            .flatten()
            .map(parse_timestamp),
        execution_time: row.try_get("execution_time").ok(),
        queue_wait_time: row.try_get("queue_wait_time").ok(),
        video_path: row.try_get("video_path").ok(),
        video_size_mb: row.try_get("video_size_mb").ok(),
        memory_peak_mb: row.try_get("memory_peak_mb").ok(),
        cpu_time_ms: row.try_get("cpu_time_ms").ok(),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.try_get("error_message").ok(),
        webhook_status: row.try_get("webhook_status").ok(),
    }
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> ApiKey {
    ApiKey {
        id: row.try_get("id").unwrap_or_default(),
        key_value: row.try_get("key_value").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        created_at: parse_timestamp(row.try_get::<String, _>("created_at").unwrap_or_default()),
        last_used: row
            .try_get::<Option<String>, _>("last_used")
            .ok()
            .flatten()
            .map(parse_timestamp),
        is_active: row.try_get::<i64, _>("is_active").unwrap_or(1) != 0,
        rate_limit_per_minute: row.try_get("rate_limit_per_minute").unwrap_or(60),
        total_requests: row.try_get("total_requests").unwrap_or_default(),
        scopes: row.try_get("scopes").unwrap_or_default(),
        expires_at: row
            .try_get::<Option<String>, _>("expires_at")
            .ok()
            .flatten()
            .map(parse_timestamp),
        webhook_url: row.try_get("webhook_url").ok(),
        notes: row.try_get("notes").ok(),
    }
}

fn parse_status(s: String) -> JobStatus {
    match s.as_str() {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "timeout" => JobStatus::TimedOut,
        _ => JobStatus::Failed,
    }
}

fn parse_timestamp(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    fn sample_job(request_id: &str) -> Job {
        Job {
            request_id: request_id.to_string(),
            api_key_id: 1,
            script: "fn main() { 1 }".to_string(),
            script_hash: "abc123".to_string(),
            script_size: 16,
            priority: 3,
            timeout: 30,
            webhook_url: None,
            tags: vec!["t".to_string()],
            user_agent: None,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            execution_time: None,
            queue_wait_time: None,
            video_path: None,
            video_size_mb: None,
            memory_peak_mb: None,
            cpu_time_ms: None,
            result: None,
            error_message: None,
            webhook_status: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrips() {
        let store = JobStore::in_memory().await.unwrap();
        let job = sample_job("req-1");
        store.insert_job(&job).await.unwrap();
        let fetched = store.get_job("req-1").await.unwrap().unwrap();
        assert_eq!(fetched.request_id, "req-1");
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.tags, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn mark_terminal_updates_status_and_result() {
        let store = JobStore::in_memory().await.unwrap();
        store.insert_job(&sample_job("req-2")).await.unwrap();
        let result = serde_json::json!({"x": 1});
        store
            .mark_terminal(
                "req-2",
                JobStatus::Completed,
                1.5,
                Some(10.0),
                Some(5.0),
                Some("/videos/req-2.webm"),
                Some(0.5),
                Some(&result),
                None,
            )
            .await
            .unwrap();
        let job = store.get_job("req-2").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(result));
    }

    #[tokio::test]
    async fn admin_key_gets_full_scopes() {
        let store = JobStore::in_memory().await.unwrap();
        store.ensure_admin_key("admin-key").await.unwrap();
        let key = store.find_api_key("admin-key").await.unwrap().unwrap();
        assert!(key.is_admin());
        assert!(key.has_scope("videos"));
        assert!(key.has_scope("dashboard"));
    }

    #[tokio::test]
    async fn recovers_queued_jobs_in_priority_order() {
        let store = JobStore::in_memory().await.unwrap();
        let mut low = sample_job("low");
        low.priority = 1;
        let mut high = sample_job("high");
        high.priority = 5;
        store.insert_job(&low).await.unwrap();
        store.insert_job(&high).await.unwrap();
        let recovered = store.recover_queued_jobs().await.unwrap();
        assert_eq!(recovered[0].request_id, "high");
    }
}
