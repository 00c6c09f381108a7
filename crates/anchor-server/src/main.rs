//! Anchor server
//!
//! JSON API over the account snapshot cache and its refresh jobs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anchor_core::config::{database_path, load_config};
use anchor_core::db::unix_timestamp;
use anchor_core::tracing_init::{LogFormat, init_tracing};
use clap::Parser;
use tracing::{info, warn};

use anchor_server::api::build_router;
use anchor_server::context::AppContext;
use anchor_server::store::CacheStore;

/// How often finished job results are checked for expiry.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "anchor-server")]
#[command(version, about = "Anchor server - co-residency cache and refresh jobs")]
struct Args {
    /// Address to listen on (overrides config).
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file (overrides config).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Explicit JSON config file.
    #[arg(long, env = "ANCHOR_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of refresh jobs running at once.
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Log line format: full, compact or json.
    #[arg(long, default_value = "full")]
    log_format: LogFormat,

    /// Output logs as JSON (shorthand for `--log-format json`).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format = if args.log_json {
        LogFormat::Json
    } else {
        args.log_format
    };
    init_tracing("anchor_server=info", format);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.listen_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    if let Some(n) = args.max_jobs {
        config.jobs.max_concurrency = n;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        "Starting anchor-server"
    );

    let db_path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?,
    };
    info!(path = %db_path.display(), "Opening cache database");
    let store = CacheStore::open(&db_path).await?;

    let ctx = Arc::new(AppContext::new(config, store)?);

    // Drop finished job results once they have been pollable long enough
    let jobs = ctx.jobs.clone();
    let result_ttl = ctx.config.jobs.result_ttl_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let removed = jobs.evict_finished(unix_timestamp(), result_ttl).await;
            if removed > 0 {
                info!(removed, "Expired job results evicted");
            }
        }
    });

    let app = build_router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(ctx.config.server.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Anchor server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Anchor server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
