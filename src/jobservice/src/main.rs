//! Job service - main entry point

use clap::{Parser, Subcommand};

use jobservice_core::{
    app::App, config::Config, telemetry, telemetry::SensitiveFieldRedactor, JobServiceError,
};

#[derive(Parser)]
#[command(name = "jobservice", version, about = "Redis-backed background job service")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "JOBSERVICE_CONFIG", global = true)]
    config: Option<String>,

    /// Override the number of concurrent workers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Deployment environment; "development" switches to pretty logs
    #[arg(long, env = "JOBSERVICE_ENV", default_value = "production", global = true)]
    environment: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Default)]
enum Commands {
    /// Run the worker pool, the reaper and the periodic scheduler
    #[default]
    Serve,
    /// Upgrade the persisted data and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(workers) = cli.workers {
        config.worker_pool.workers = workers;
    }

    telemetry::init_logging(&config.logging, &cli.environment)?;
    telemetry::init_metrics(&config.metrics, "jobservice")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        redis = %SensitiveFieldRedactor::global().redact_value(&config.redis.url),
        namespace = %config.redis.namespace,
        "Starting job service"
    );

    let app = App::build(&config).await.inspect_err(JobServiceError::log)?;

    match cli.command.unwrap_or_default() {
        Commands::Migrate => {
            let outcome = app.migrate().await.inspect_err(JobServiceError::log)?;
            tracing::info!(outcome = ?outcome, "Migration finished");
        }
        Commands::Serve => {
            app.start().await.inspect_err(JobServiceError::log)?;
            shutdown_signal().await;
            app.shutdown().await;
        }
    }

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
