#[cfg(test)]
mod integration_tests {
    use crate::error::CircuitBreakerTable;
    use crate::models::{JobStatus, Priority};
    use crate::queue::PriorityQueue;
    use crate::validator::Validator;
    use crate::Config;
    use std::time::Duration;

    #[test]
    fn config_defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_executions, 10);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.max_script_size, 50_000);
        assert_eq!(config.video_retention_days, 7);
        assert_eq!(config.browser_pool_size, 10);
        assert!(config.admin_api_key.is_none());
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::validate(0).is_err());
        assert!(Priority::validate(1).is_ok());
        assert!(Priority::validate(5).is_ok());
        assert!(Priority::validate(6).is_err());
    }

    #[test]
    fn job_status_serializes_timeout_as_lowercase_literal() {
        let s = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(s, "\"timeout\"");
    }

    #[test]
    fn validator_rejects_missing_main() {
        let validator = Validator::new(50_000);
        let result = validator.validate("fn not_main() { 1 }");
        assert!(!result.is_valid);
    }

    #[test]
    fn validator_rejects_denied_globals() {
        let validator = Validator::new(50_000);
        let result = validator.validate("fn main() { eval(\"1+1\") }");
        assert!(!result.is_valid);
    }

    #[test]
    fn validator_rejects_oversized_script() {
        let validator = Validator::new(16);
        let result = validator.validate("fn main() { /* way too long for sixteen bytes */ }");
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn queue_pops_higher_priority_first() {
        let queue = PriorityQueue::new(10);
        queue.push("low".to_string(), Priority::validate(1).unwrap()).await.unwrap();
        queue.push("high".to_string(), Priority::validate(5).unwrap()).await.unwrap();

        let first = queue.pop().await;
        assert_eq!(first.request_id, "high");
        let second = queue.pop().await;
        assert_eq!(second.request_id, "low");
    }

    #[tokio::test]
    async fn queue_preserves_fifo_within_same_priority() {
        let queue = PriorityQueue::new(10);
        queue.push("first".to_string(), Priority::validate(3).unwrap()).await.unwrap();
        queue.push("second".to_string(), Priority::validate(3).unwrap()).await.unwrap();

        assert_eq!(queue.pop().await.request_id, "first");
        assert_eq!(queue.pop().await.request_id, "second");
    }

    #[tokio::test]
    async fn queue_rejects_past_capacity() {
        let queue = PriorityQueue::new(1);
        queue.push("one".to_string(), Priority::default()).await.unwrap();
        let err = queue.push("two".to_string(), Priority::default()).await;
        assert!(err.is_err());
    }

    #[test]
    fn circuit_breaker_opens_after_five_consecutive_failures() {
        let table = CircuitBreakerTable::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            table.record_failure("abc123");
        }
        assert!(table.can_execute("abc123"));
        table.record_failure("abc123");
        assert!(!table.can_execute("abc123"));
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let table = CircuitBreakerTable::new(2, Duration::from_secs(60));
        table.record_failure("def456");
        table.record_failure("def456");
        assert!(!table.can_execute("def456"));
        table.record_success("def456");
        assert!(table.can_execute("def456"));
    }

    #[tokio::test]
    async fn in_memory_job_store_round_trips_a_job() {
        use crate::models::Job;
        use crate::store::JobStore;

        let store = JobStore::in_memory().await.expect("in-memory store");
        let job = Job {
            request_id: "req-1".to_string(),
            api_key_id: 1,
            script: "fn main() { 1 }".to_string(),
            script_hash: "deadbeef".to_string(),
            script_size: 15,
            priority: 1,
            timeout: 10,
            webhook_url: None,
            tags: vec![],
            user_agent: None,
            status: JobStatus::Queued,
            created_at: chrono::Utc::now(),
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
        };

        store.insert_job(&job).await.unwrap();
        let fetched = store.get_job("req-1").await.unwrap().expect("job exists");
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.script_hash, "deadbeef");
    }
}
