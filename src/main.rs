//! delta-sync server and maintenance CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delta_sync::http::{self, AppState, RoleHeaderResolver};
use delta_sync::retention::{RetentionPruner, RetentionScheduler};
use delta_sync::telemetry::init_tracing;
use delta_sync::{ChangeStore, DeltaQueryService, SyncConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Change-log delta synchronization service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "DELTA_SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the delta feed over HTTP
    Serve {
        /// Bind address, overriding server.host/server.port
        #[arg(long)]
        bind: Option<String>,
    },

    /// Delete change-log entries older than the retention window
    Prune {
        #[arg(long)]
        retention_days: u32,
    },

    /// Print store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;

    init_tracing(&config.logging.level, &config.logging.format);

    let store = Arc::new(
        ChangeStore::open_or_create(config.store_config())
            .with_context(|| format!("opening store at {}", config.store.path.display()))?,
    );

    match cli.command {
        Command::Serve { bind } => serve(config, store, bind).await,
        Command::Prune { retention_days } => {
            let report = RetentionPruner::new(store).prune_days(retention_days)?;
            println!(
                "deleted {} entries older than {}",
                report.deleted,
                report.cutoff.to_rfc3339()
            );
            Ok(())
        }
        Command::Stats => {
            let stats = store.stats();
            println!("entries:      {}", stats.entry_count);
            println!("tracked keys: {}", stats.tracked_keys);
            println!(
                "oldest:       {}",
                stats.oldest.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
            );
            println!(
                "newest:       {}",
                stats.newest.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
            );
            println!("log bytes:    {}", stats.log_size_bytes);
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig, store: Arc<ChangeStore>, bind: Option<String>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting delta-sync server");

    let scheduler = if config.retention.enabled {
        Some(RetentionScheduler::spawn(
            RetentionPruner::new(Arc::clone(&store)),
            config.retention.retention(),
            config.retention.interval(),
        )?)
    } else {
        None
    };

    let service = DeltaQueryService::new(Arc::clone(&store), config.scope_policy())
        .with_default_lookback(config.default_lookback());
    let resolver = RoleHeaderResolver::new(
        &config.feed.role_header,
        config.feed.privileged_roles.iter().cloned(),
    )
    .context("invalid feed.role_header")?;

    let app = http::router(AppState {
        service: Arc::new(service),
        caller_resolver: Arc::new(resolver),
    });

    let addr = bind.unwrap_or_else(|| config.server.bind_addr());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "REST server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("REST server error")?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown();
    }
    store.sync()?;
    info!("delta-sync server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
