use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tally_core::CategorySet;
use tally_server::{AppState, Poller, ServerConfig};
use tally_store::{Aggregator, Connect, RetryPolicy, SqliteConnector, StoreConnector, VoteSource};
use tally_telemetry::{LogFormat, TelemetryConfig};
use tracing::Level;
use tokio_util::sync::CancellationToken;

/// Real-time tally broadcaster: polls vote counts and pushes them to WebSocket subscribers.
#[derive(Debug, Parser)]
#[command(name = "tally", version)]
struct Cli {
    /// HTTP / WebSocket listening port.
    #[arg(long, env = "PORT", default_value_t = 4000)]
    port: u16,

    /// Path of the SQLite votes database.
    #[arg(long, env = "TALLY_DB_PATH", default_value = "votes.db")]
    db_path: PathBuf,

    /// Create the database file if it does not exist instead of waiting for it.
    #[arg(long, env = "TALLY_CREATE_DB")]
    create_if_missing: bool,

    #[arg(long, env = "TALLY_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    #[arg(long, env = "TALLY_QUERY_TIMEOUT_MS", default_value_t = 5000)]
    query_timeout_ms: u64,

    #[arg(long, env = "TALLY_CONNECT_ATTEMPTS", default_value_t = 1000)]
    connect_attempts: u32,

    #[arg(long, env = "TALLY_CONNECT_RETRY_MS", default_value_t = 1000)]
    connect_retry_ms: u64,

    /// Comma-separated categories always present in published scores.
    #[arg(long, env = "TALLY_CATEGORIES", default_value = "a,b")]
    categories: CategorySet,

    #[arg(long, env = "TALLY_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Per-module level overrides, e.g. `tally_store=debug,tower_http=warn`.
    #[arg(
        long = "log-module",
        env = "TALLY_LOG_MODULES",
        value_delimiter = ',',
        value_parser = tally_telemetry::parse_module_level
    )]
    log_modules: Vec<(String, Level)>,

    /// `json` or `pretty`.
    #[arg(long, env = "TALLY_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli.log_modules.clone(),
        format: cli.log_format,
    };
    if let Err(e) = tally_telemetry::init_telemetry(&telemetry) {
        eprintln!("tally: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = format!("{e:#}");
            tracing::error!(error = %error, "fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(db_path = %cli.db_path.display(), "Starting tally server");

    let connector = Arc::new(StoreConnector::new(
        SqliteConnector::new(cli.db_path.clone(), cli.create_if_missing),
        RetryPolicy {
            max_attempts: cli.connect_attempts,
            retry_interval: Duration::from_millis(cli.connect_retry_ms),
        },
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), cancel.clone()));

    let config = ServerConfig {
        port: cli.port,
        ..Default::default()
    };
    serve(
        connector,
        Aggregator::new(cli.categories, Duration::from_millis(cli.query_timeout_ms)),
        Duration::from_millis(cli.poll_interval_ms),
        &config,
        cancel,
    )
    .await
}

/// Cancel `token` once `signal` fires. If the signal cannot be listened for,
/// the error is logged and the token is never cancelled.
async fn cancel_on_signal<F>(signal: F, token: CancellationToken)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("Shutdown signal received");
            token.cancel();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    }
}

/// Acquire the store, then run the server and the poller until `cancel`
/// fires or the store is lost for good. Nothing is polled or served unless
/// acquisition succeeds.
async fn serve<C>(
    connector: Arc<StoreConnector<C>>,
    aggregator: Aggregator,
    poll_interval: Duration,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    C: Connect,
    C::Conn: VoteSource,
{
    let acquired = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        acquired = connector.acquire() => acquired.context("store acquisition failed")?,
    };

    let hub = config.build_hub();
    let poller = Poller::new(Arc::clone(&connector), aggregator, Arc::clone(&hub), poll_interval);

    let state = AppState {
        hub,
        store_state: connector.subscribe(),
        poll_stats: poller.stats(),
    };
    let server = tally_server::start(config, state, cancel.clone())
        .await
        .context("failed to bind server")?;
    tracing::info!(port = server.port, "Tally server ready");

    let poll_result = poller.run(acquired.conn, cancel.clone()).await;

    // A fatal poller exit also takes the server down
    cancel.cancel();
    server.wait().await;
    tracing::info!("Shutting down");

    poll_result.context("poller stopped")
}
