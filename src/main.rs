use clap::Parser;
use webas::{setup_logging, Cli, CliRunner, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting webas v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let cli_runner = CliRunner::new(config, &args).await?;

    let result = cli_runner.run(args.command).await;

    if let Err(e) = result {
        error!("application error: {}", e);
        std::process::exit(1);
    }

    info!("webas stopped");
    Ok(())
}

fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        Config::load_from_file(config_path.to_str().ok_or("non-utf8 config path")?)?
    } else {
        Config::default()
    };

    config.apply_env_overrides();

    if let Some(pool_size) = args.pool_size {
        config.browser_pool_size = pool_size;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_executions = max_concurrent;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("configuration loaded");
    info!(browser_pool_size = config.browser_pool_size, "browser pool size");
    info!(max_concurrent_executions = config.max_concurrent_executions, "worker count");

    Ok(config)
}

