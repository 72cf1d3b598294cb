use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tidekv::store::{Kv, KvOptions};
use tokio::sync::watch;

use tidekv_server::config::ConfigLoad;
use tidekv_server::routes;
use tidekv_server::sweep::spawn_sweepers;
use tidekv_server::trace;

#[derive(Debug, Parser)]
#[command(name = "tidekv-server", about = "Versionstamped kv storage over HTTP", version)]
struct Args {
    /// TOML config file.
    #[arg(short, long, env = "TIDEKV_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides the config file.
    #[arg(long, env = "TIDEKV_BIND")]
    bind: Option<String>,

    /// Database path, overrides the config file.
    #[arg(long, env = "TIDEKV_DB")]
    db: Option<PathBuf>,

    /// Log level, overrides the config file.
    #[arg(long, env = "TIDEKV_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => ConfigLoad::load(path)?,
        None => ConfigLoad::default(),
    };
    if args.bind.is_some() {
        cfg.bind = args.bind.clone();
    }
    if let Some(db) = &args.db {
        cfg.db_path = Some(db.display().to_string());
    }
    if args.log_level.is_some() {
        cfg.log_level = args.log_level.clone();
    }
    cfg.validate()?;
    let cfg = Arc::new(cfg);

    trace::init_logging(cfg.log_level())?;

    let kv = Kv::open_with(
        cfg.db_path(),
        KvOptions { pool_size: cfg.pool_size.unwrap_or(8) },
    )
    .with_context(|| format!("cannot open database at {}", cfg.db_path()))?;
    info!("opened database at {}", cfg.db_path());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweepers = spawn_sweepers(kv.clone(), cfg.clone(), shutdown_rx);

    let app = routes::router(kv.clone(), cfg.clone());
    let listener = tokio::net::TcpListener::bind(cfg.bind())
        .await
        .with_context(|| format!("cannot bind {}", cfg.bind()))?;
    info!("listening on {}", cfg.bind());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Stop sweepers, then flush metrics one last time if persistence is on.
    let _ = shutdown_tx.send(true);
    for sweeper in sweepers {
        let _ = sweeper.await;
    }
    if cfg.metrics_persist() {
        let _ = kv.flush_metrics();
    }
    info!("bye");
    Ok(())
}
