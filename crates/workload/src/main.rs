//! Workload driver entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use saga::{CompensationEngine, DeliveryConfig, ExecutionContext, SessionEnd};
use sqlx::postgres::PgPoolOptions;
use store::PostgresStore;
use tokio::signal;
use tokio::sync::watch;
use workload::logging::{self, LogFormat};
use workload::{Config, Supervisor, WorkloadError};

#[derive(Debug, Parser)]
#[command(name = "workload", version, about = "Order-processing workload driver")]
struct Cli {
    /// PostgreSQL connection string.
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one worker per command file.
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Reconcile payment totals in the background while the workers run.
        #[arg(long)]
        with_compensation: bool,

        /// Write one JSON report per worker into this directory.
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Orders delivered per district by each delivery command.
        #[arg(long, default_value_t = 1)]
        orders_per_district: usize,
    },
    /// Run one reconciliation session and exit.
    Compensate,
    /// Apply database migrations.
    Migrate,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, stopping");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, stopping");
        }
    }
}

async fn connect(config: &Config) -> Result<PostgresStore, WorkloadError> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| WorkloadError::Config("DATABASE_URL is not set".to_string()))?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await?;
    Ok(PostgresStore::new(pool))
}

async fn run(cli: Cli, config: Config) -> Result<ExitCode, WorkloadError> {
    let store = connect(&config).await?;

    match cli.command {
        Commands::Migrate => {
            store.run_migrations().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Compensate => {
            let ctx = ExecutionContext::new(store, config.retry);
            let engine = CompensationEngine::new(ctx, config.compensation);

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = cancel_tx.send(true);
            });

            let summary = engine.run_session(cancel_rx).await;
            tracing::info!(
                rounds = summary.rounds,
                advanced = summary.advanced,
                skipped = summary.skipped,
                warehouse_delta = %summary.warehouse_delta,
                district_delta = %summary.district_delta,
                end = ?summary.end,
                "reconciliation session finished"
            );
            Ok(match summary.end {
                SessionEnd::Faulted(_) => ExitCode::FAILURE,
                SessionEnd::BudgetElapsed | SessionEnd::Cancelled => ExitCode::SUCCESS,
            })
        }
        Commands::Run {
            files,
            with_compensation,
            report_dir,
            orders_per_district,
        } => {
            let ctx = ExecutionContext::new(store, config.retry);
            let mut supervisor = Supervisor::new(ctx).with_delivery(DeliveryConfig {
                orders_per_district,
            });
            if with_compensation {
                supervisor = supervisor.with_compensation(config.compensation);
            }
            if let Some(dir) = report_dir {
                supervisor = supervisor.with_report_dir(dir);
            }

            let summary = supervisor.run(&files).await;
            for report in summary.reports() {
                tracing::info!(
                    worker = report.worker,
                    source = %report.source,
                    executed = report.executed,
                    failed = report.failed,
                    throughput = report.throughput,
                    mean_ms = report.latency.mean_ms,
                    p50_ms = report.latency.p50_ms,
                    p95_ms = report.latency.p95_ms,
                    p99_ms = report.latency.p99_ms,
                    "worker report"
                );
            }
            for failure in summary.failures() {
                tracing::error!(error = %failure, "worker did not finish");
            }
            Ok(if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }

    logging::init(cli.log_format, &config.log_level);

    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "workload driver failed");
            ExitCode::FAILURE
        }
    }
}
