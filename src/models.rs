use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states a Job can occupy. The only valid transitions are
/// QUEUED -> RUNNING -> {COMPLETED, FAILED, TIMED_OUT} and QUEUED -> FAILED,
/// RUNNING -> FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub fn validate(value: i64) -> Result<Priority, String> {
        if (1..=5).contains(&value) {
            Ok(Priority(value as u8))
        } else {
            Err(format!("priority must be in 1..5, got {value}"))
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(1)
    }
}

/// Bounds a submitted `timeout` to `[10, 600]` seconds, per §4.1 — a job
/// that sits under the floor never gives the browser time to do anything
/// useful, and one above the ceiling can pin a worker indefinitely.
pub fn validate_timeout(value: i64) -> Result<i64, String> {
    if (10..=600).contains(&value) {
        Ok(value)
    } else {
        Err(format!("timeout must be in 10..600 seconds, got {value}"))
    }
}

/// Inbound script submission, as accepted by `POST /execute` and `/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub template_id: Option<i64>,
    pub timeout: i64,
    pub priority: i64,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptResponse {
    pub request_id: String,
    pub status: JobStatus,
    pub queue_position: usize,
    pub estimated_wait: f64,
}

/// One submitted script execution, as held in the Job Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub request_id: String,
    pub api_key_id: i64,
    pub script: String,
    pub script_hash: String,
    pub script_size: i64,
    pub priority: i64,
    pub timeout: i64,
    pub webhook_url: Option<String>,
    pub tags: Vec<String>,
    pub user_agent: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time: Option<f64>,
    pub queue_wait_time: Option<f64>,
    pub video_path: Option<String>,
    pub video_size_mb: Option<f64>,
    pub memory_peak_mb: Option<f64>,
    pub cpu_time_ms: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub webhook_status: Option<String>,
}

/// Everything the Executor fills in once a job reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub status: JobStatus,
    pub execution_time: f64,
    pub queue_wait_time: f64,
    pub memory_peak_mb: Option<f64>,
    pub cpu_time_ms: Option<f64>,
    pub video_path: Option<String>,
    pub video_size_mb: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Queued
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub request_id: String,
    pub duration_seconds: f64,
    pub size_mb: f64,
    pub created_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub estimated_complexity: String,
    pub estimated_duration: i64,
    pub detected_operations: Vec<String>,
}

/// Outbound webhook envelope, fixed shape per the dispatcher's contract.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event_type: String,
    pub request_id: String,
    pub api_key_id: i64,
    pub status: JobStatus,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub key_value: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub rate_limit_per_minute: i64,
    pub total_requests: i64,
    pub scopes: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub webhook_url: Option<String>,
    pub notes: Option<String>,
}

impl ApiKey {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.split(',').any(|s| s.trim() == scope)
    }

    pub fn is_admin(&self) -> bool {
        self.has_scope("admin")
    }
}

/// One day's rollup, written opportunistically by the Cleanup Scheduler and
/// surfaced as a one-line trend from `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: String,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub avg_execution_time: f64,
    pub total_video_size_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bounds() {
        assert!(Priority::validate(0).is_err());
        assert!(Priority::validate(1).is_ok());
        assert!(Priority::validate(5).is_ok());
        assert!(Priority::validate(6).is_err());
    }

    #[test]
    fn timeout_bounds() {
        assert!(validate_timeout(9).is_err());
        assert!(validate_timeout(10).is_ok());
        assert!(validate_timeout(600).is_ok());
        assert!(validate_timeout(601).is_err());
    }

    #[test]
    fn job_status_round_trips_through_json() {
        let s = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(s, "\"timeout\"");
        let back: JobStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, JobStatus::TimedOut);
    }

    #[test]
    fn admin_scope_implies_videos_and_dashboard() {
        let key = ApiKey {
            id: 1,
            key_value: "k".into(),
            name: "n".into(),
            created_at: Utc::now(),
            last_used: None,
            is_active: true,
            rate_limit_per_minute: 60,
            total_requests: 0,
            scopes: "execute,videos,admin,dashboard".into(),
            expires_at: None,
            webhook_url: None,
            notes: None,
        };
        assert!(key.is_admin());
        assert!(key.has_scope("videos"));
        assert!(key.has_scope("dashboard"));
    }
}
