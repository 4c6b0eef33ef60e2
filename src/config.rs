//! Process-wide configuration: defaults, file/env overrides, validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide settings, read once at startup from an optional TOML file,
/// then overridden by environment variables, then by CLI flags — in that
/// order, matching the teacher's file-then-CLI-override `load_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent_executions: usize,
    pub max_queue_size: usize,
    pub max_script_size: usize,
    pub max_execution_time: u64,
    pub video_retention_days: i64,
    pub video_cleanup_hour: u32,
    pub video_width: u32,
    pub video_height: u32,
    pub browser_pool_size: usize,
    pub browser_warmup_pages: usize,
    pub max_webhook_retries: u32,
    pub webhook_timeout: Duration,
    pub database_path: String,
    pub video_root: String,
    pub bind_address: String,
    pub admin_api_key: Option<String>,
    pub chrome_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            max_queue_size: 100,
            max_script_size: 50_000,
            max_execution_time: 300,
            video_retention_days: 7,
            video_cleanup_hour: 2,
            video_width: 1280,
            video_height: 720,
            browser_pool_size: 10,
            browser_warmup_pages: 3,
            max_webhook_retries: 3,
            webhook_timeout: Duration::from_secs(10),
            database_path: "./data/database.db".to_string(),
            video_root: "./data/videos".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            admin_api_key: None,
            chrome_path: None,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Overlays `WEBAS_*` environment variables on top of `self`, matching
    /// the field names in this struct.
    pub fn apply_env_overrides(&mut self) {
        macro_rules! env_parsed {
            ($field:ident, $key:expr) => {
                if let Ok(v) = std::env::var($key) {
                    if let Ok(parsed) = v.parse() {
                        self.$field = parsed;
                    }
                }
            };
        }

        env_parsed!(max_concurrent_executions, "WEBAS_MAX_CONCURRENT_EXECUTIONS");
        env_parsed!(max_queue_size, "WEBAS_MAX_QUEUE_SIZE");
        env_parsed!(max_script_size, "WEBAS_MAX_SCRIPT_SIZE");
        env_parsed!(browser_pool_size, "WEBAS_BROWSER_POOL_SIZE");
        env_parsed!(browser_warmup_pages, "WEBAS_BROWSER_WARMUP_PAGES");
        env_parsed!(video_retention_days, "WEBAS_VIDEO_RETENTION_DAYS");
        env_parsed!(video_cleanup_hour, "WEBAS_VIDEO_CLEANUP_HOUR");

        if let Ok(v) = std::env::var("WEBAS_DATABASE_PATH") {
            self.database_path = v;
        }
        if let Ok(v) = std::env::var("WEBAS_VIDEO_ROOT") {
            self.video_root = v;
        }
        if let Ok(v) = std::env::var("WEBAS_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = std::env::var("WEBAS_ADMIN_API_KEY") {
            self.admin_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("WEBAS_CHROME_PATH") {
            self.chrome_path = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_executions == 0 {
            anyhow::bail!("max_concurrent_executions must be greater than 0");
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be greater than 0");
        }
        if self.browser_pool_size == 0 {
            anyhow::bail!("browser_pool_size must be greater than 0");
        }
        if self.video_width == 0 || self.video_height == 0 {
            anyhow::bail!("video dimensions must be greater than 0");
        }
        if self.video_cleanup_hour > 23 {
            anyhow::bail!("video_cleanup_hour must be in 0..23");
        }
        Ok(())
    }

    /// Chrome launch flags for a headless, sandboxless, GPU-less instance,
    /// matching the teacher's `get_chrome_args` shape but trimmed to what
    /// recording-enabled job execution actually needs.
    pub fn chrome_args(&self, instance_id: usize) -> Vec<String> {
        vec![
            "--headless=new".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-setuid-sandbox".to_string(),
            format!("--remote-debugging-port={}", 9222 + instance_id),
            format!("--window-size={},{}", self.video_width, self.video_height),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let c = Config::default();
        assert_eq!(c.max_concurrent_executions, 10);
        assert_eq!(c.max_queue_size, 100);
        assert_eq!(c.max_script_size, 50_000);
        assert_eq!(c.video_retention_days, 7);
        assert_eq!(c.video_cleanup_hour, 2);
        assert_eq!(c.browser_pool_size, 10);
        assert_eq!(c.max_webhook_retries, 3);
        assert!(c.admin_api_key.is_none());
    }

    #[test]
    fn validate_rejects_zero_pool_size() {
        let mut c = Config::default();
        c.browser_pool_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_cleanup_hour() {
        let mut c = Config::default();
        c.video_cleanup_hour = 24;
        assert!(c.validate().is_err());
    }
}
