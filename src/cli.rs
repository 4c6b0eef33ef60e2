//! Command-line entry points: parse args, load config, dispatch to a
//! subcommand. Kept close to the teacher's `Cli`/`Commands`/`CliRunner`
//! shape; `Batch`/`Single` (screenshot-batch commands, no counterpart once
//! the service runs user scripts against a job queue) are dropped,
//! `Server` — previously a stub — is implemented for real, and
//! `Validate`/`Health` are repointed at the new `Validator`/health
//! aggregator.

use crate::browser_pool::BrowserPool;
use crate::cleanup::CleanupScheduler;
use crate::error::CircuitBreakerTable;
use crate::executor::Executor;
use crate::health::SystemHealthChecker;
use crate::http::{self, AppState};
use crate::metrics::{Metrics, MetricsCollector, PrometheusExporter};
use crate::queue::PriorityQueue;
use crate::store::JobStore;
use crate::validator::Validator;
use crate::video::VideoStore;
use crate::webhook::WebhookDispatcher;
use crate::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "webas")]
#[command(about = "Headless-browser script execution service")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Maximum concurrent executions")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the script execution server
    Server {
        #[arg(long, help = "Bind address, overrides config")]
        bind: Option<String>,
    },

    /// Validate a script against the size/denylist/complexity rules
    Validate {
        #[arg(short, long, help = "File containing the script to validate")]
        script: PathBuf,
    },

    /// Show browser pool / queue / webhook / circuit breaker health
    Health {
        #[arg(long, help = "Show detailed browser instance information")]
        detailed: bool,
    },

    /// Create or update the SQLite schema without starting the server
    Migrate,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub async fn new(mut config: Config, args: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(pool_size) = args.pool_size {
            config.browser_pool_size = pool_size;
        }
        if let Some(max_concurrent) = args.max_concurrent {
            config.max_concurrent_executions = max_concurrent;
        }
        if let Some(chrome_path) = &args.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }

        Ok(Self { config })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Server { bind } => self.run_server(bind).await,
            Commands::Validate { script } => self.validate_script(script).await,
            Commands::Health { detailed } => self.show_health(detailed).await,
            Commands::Migrate => self.run_migrate().await,
        }
    }

    /// Applies the SQLite schema and exits, for deploy scripts that want
    /// migrations to run as a distinct step ahead of `server`.
    pub async fn run_migrate(&self) -> Result<(), Box<dyn std::error::Error>> {
        JobStore::migrate(&self.config.database_path).await?;
        println!("migrated database at {}", self.config.database_path);
        Ok(())
    }

    /// Wires every component described in §5: store, browser pool, queue,
    /// circuit breakers, executor, worker pool, webhook retry loop,
    /// cleanup scheduler, and the axum HTTP surface, all sharing one root
    /// cancellation token for graceful shutdown.
    pub async fn run_server(&self, bind: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
        let mut config = self.config.clone();
        if let Some(bind) = bind {
            config.bind_address = bind;
        }
        let config = Arc::new(config);

        let store = Arc::new(JobStore::connect(&config.database_path).await?);
        if let Some(admin_key) = &config.admin_api_key {
            store.ensure_admin_key(admin_key).await?;
        }

        let videos = VideoStore::new(config.video_root.clone().into(), config.video_width, config.video_height);
        videos.initialize().await?;

        let browser_pool = Arc::new(BrowserPool::new((*config).clone()).await?);
        let queue = PriorityQueue::new(config.max_queue_size);
        let breakers = CircuitBreakerTable::new(5, std::time::Duration::from_secs(60));
        let validator = Arc::new(Validator::new(config.max_script_size));
        let webhooks = WebhookDispatcher::new(store.clone(), config.webhook_timeout, config.max_webhook_retries);
        let metrics = Arc::new(Metrics::new());
        let prometheus = Arc::new(PrometheusExporter::install()?);

        let executor = Arc::new(Executor::new(
            store.clone(),
            videos.clone(),
            browser_pool.clone(),
            breakers.clone(),
            &config,
        ));

        let shutdown = CancellationToken::new();

        MetricsCollector::new(metrics.clone()).start_collection().await;

        for job in store.recover_queued_jobs().await? {
            let priority = crate::models::Priority::validate(job.priority).unwrap_or_default();
            queue.push(job.request_id, priority).await?;
        }

        let _worker_pool = crate::worker::WorkerPool::spawn(
            config.max_concurrent_executions,
            queue.clone(),
            browser_pool.clone(),
            executor,
            store.clone(),
            webhooks.clone(),
            metrics.clone(),
            shutdown.clone(),
        );

        webhooks.clone().spawn_retry_loop(shutdown.clone());

        let cleanup = Arc::new(CleanupScheduler::new(store.clone(), videos.clone(), breakers.clone(), &config));
        cleanup.spawn(shutdown.clone()).await;

        let state = AppState {
            store,
            queue,
            videos,
            webhooks,
            validator,
            breakers,
            config: config.clone(),
            metrics: prometheus,
            cleanup: cleanup.clone(),
            started_at: Instant::now(),
        };

        let app = http::build_router(state);
        let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
        info!(bind_address = %config.bind_address, "webas server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown_signal(shutdown))
            .await?;

        Ok(())
    }

    pub async fn validate_script(&self, script_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let script = fs::read_to_string(&script_path).await?;
        let validator = Validator::new(self.config.max_script_size);
        let result = validator.validate(&script);

        println!("Validation result for {}:", script_path.display());
        println!("  Valid: {}", result.is_valid);
        println!("  Complexity: {}", result.estimated_complexity);
        println!("  Estimated duration: {}s", result.estimated_duration);
        println!("  Detected operations: {:?}", result.detected_operations);
        if !result.errors.is_empty() {
            println!("  Errors:");
            for error in &result.errors {
                println!("    - {error}");
            }
        }
        if !result.warnings.is_empty() {
            println!("  Warnings:");
            for warning in &result.warnings {
                println!("    - {warning}");
            }
        }

        if !result.is_valid {
            return Err("script failed validation".into());
        }
        Ok(())
    }

    pub async fn show_health(&self, detailed: bool) -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(JobStore::connect(&self.config.database_path).await?);
        let browser_pool = Arc::new(BrowserPool::new(self.config.clone()).await?);
        let queue = PriorityQueue::new(self.config.max_queue_size);
        let webhooks = WebhookDispatcher::new(store.clone(), self.config.webhook_timeout, self.config.max_webhook_retries);
        let breakers = CircuitBreakerTable::new(5, std::time::Duration::from_secs(60));
        let metrics = Arc::new(Metrics::new());

        let mut checker = SystemHealthChecker::new(
            browser_pool.clone(),
            store,
            queue,
            webhooks,
            breakers,
            metrics,
        );
        let status = checker.check_system_health().await;

        println!("System Health Check");
        println!("====================");
        println!("Overall: {:?}", status.overall);
        println!("Performance: {:?}", status.performance);
        println!("Resources: {:?}", status.resources);
        println!("Errors: {:?}", status.errors);

        if detailed {
            let pool_stats = browser_pool.get_stats().await;
            println!("\nBrowser Pool:");
            println!("  Total instances: {}", pool_stats.total_instances);
            println!("  Healthy instances: {}", pool_stats.healthy_instances);
            println!("  Warm instances: {}", pool_stats.warm_instances);
            println!("  Failed instances: {}", pool_stats.failed_instances);
        }

        browser_pool.shutdown().await;
        Ok(())
    }
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
    shutdown.cancel();
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
