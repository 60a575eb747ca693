//! pg-console - query execution core for a browser-based PostgreSQL console.

use std::sync::Arc;

use anyhow::Context;
use pg_console::classifier::{parse_query, ExecutionStrategy};
use pg_console::cli::{Cli, Command, ExecArgs, ServeArgs, SqlSource};
use pg_console::config::Config;
use pg_console::db::MockConnector;
use pg_console::logging;
use pg_console::pool::PoolManager;
use pg_console::query::{ExecuteRequest, QueryExecutor};
use pg_console::server::{self, AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    if cli.log_file {
        logging::init_file_logging();
    } else {
        logging::init_stderr_logging();
    }

    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Command::Serve(args) => serve(args, config).await,
        Command::Exec(args) => exec(args, config).await,
        Command::Classify(source) => classify(&source),
    }
}

fn build_pools(config: &Config, mock_db: bool) -> Arc<PoolManager> {
    let manager = if mock_db {
        warn!("Using in-memory mock database");
        PoolManager::with_connector(Arc::new(MockConnector::new()), config.pool.clone())
    } else {
        PoolManager::new(config.pool.clone())
    };
    Arc::new(manager)
}

async fn serve(args: ServeArgs, config: Config) -> anyhow::Result<()> {
    let pools = build_pools(&config, args.mock_db);
    let executor = Arc::new(QueryExecutor::new(Arc::clone(&pools)));

    let token = CancellationToken::new();
    let sweeper = pools.spawn_idle_sweeper(token.clone());

    let bind = args.bind.unwrap_or(config.server.bind);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
    });

    let served = server::serve(listener, AppState { executor }, token.clone()).await;

    token.cancel();
    if let Err(e) = sweeper.await {
        warn!("Idle sweeper task failed: {}", e);
    }
    pools.close_all_pools().await;

    served.context("HTTP server failed")
}

async fn exec(args: ExecArgs, config: Config) -> anyhow::Result<()> {
    let sql = args.source.read()?;
    let connection = args.resolve_connection(&config)?;
    info!("Connection: {}", connection.display_string());

    let pools = build_pools(&config, args.mock_db);
    let executor = QueryExecutor::new(Arc::clone(&pools));

    let request = ExecuteRequest::new(connection.to_credentials(), sql);
    let response = executor.handle(&request).await;
    pools.close_all_pools().await;

    let output = if args.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{output}");

    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn classify(source: &SqlSource) -> anyhow::Result<()> {
    let sql = source.read()?;
    let statements = parse_query(&sql)?;
    let strategy = ExecutionStrategy::for_batch(&statements);

    let output = serde_json::json!({
        "strategy": strategy,
        "statements": statements,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
