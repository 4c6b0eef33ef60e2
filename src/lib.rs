//! # webas
//!
//! A headless-browser script execution service: clients submit a small Rhai
//! script against a priority queue, a fixed pool of workers leases a browser
//! from a pooled Chrome instance set and runs the script's `main` with a
//! restricted global scope, recording the session as a `.webm` via CDP
//! screencast. Terminal state lands in a SQLite job store and fires an
//! optional webhook.
//!
//! ## Pipeline
//!
//! `POST /execute` (validate, fingerprint, circuit-breaker check) → bounded
//! priority queue → N worker tasks → browser pool lease → Executor (RUNNING
//! transition, script eval, recording, terminal write) → webhook dispatch.
//! A daily cleanup sweep expires old recordings and compacts the store.
//!
//! ## Features
//!
//! - **Priority queue**: strict priority, FIFO within a priority tier, bounded capacity
//! - **Browser pool**: fixed-size, warm-up pages, automatic replacement of dead instances
//! - **Restricted scripting**: Rhai, no filesystem/process/module primitives
//! - **Video recording**: CDP screencast muxed to `.webm` via `ffmpeg`, best-effort on failure
//! - **Circuit breaker**: per-script-fingerprint, opens after repeated failures
//! - **Webhook delivery**: bounded retries with exponential backoff
//! - **Retention**: daily sweep of expired videos and stale execution rows
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webas::{Config, CliRunner, Cli};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let args = Cli::parse();
//!     let config = Config::default();
//!     let runner = CliRunner::new(config, &args).await?;
//!     runner.run(args.command).await
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! webas server --bind 0.0.0.0:8080
//! webas validate --script path/to/script.rhai
//! webas health --detailed
//! ```

/// Configuration and settings for the service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// Worker processes for concurrent job execution
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Health checking system for browser instances and service
pub mod health;

/// Utility functions and helpers
pub mod utils;

/// Request/job/webhook data model
pub mod models;

/// Script size/denylist/complexity validation
pub mod validator;

/// The restricted Rhai engine and `page` bridge scripts run under
pub mod scripting;

/// Bounded priority queue feeding the worker pool
pub mod queue;

/// Durable job state backed by SQLite
pub mod store;

/// Outbound webhook delivery with bounded retry
pub mod webhook;

/// Date-nested video artifact storage and retention
pub mod video;

/// CDP screencast capture, muxed to `.webm` via `ffmpeg`
pub mod recorder;

/// Daily retention sweep scheduler
pub mod cleanup;

/// Per-job execution: recording, timeout, resource accounting
pub mod executor;

/// Minimal HTTP surface (axum)
pub mod http;

#[cfg(test)]
mod tests;

pub use browser_pool::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use metrics::*;
pub use models::*;
pub use utils::*;
