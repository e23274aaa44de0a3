//! RingDB daemon - TCP/UDP ingestion and HTTP query server

mod api;
mod config;
mod tcp;
mod udp;

use anyhow::Context;
use clap::Parser;
use crate::config::ServerConfig;
use ringdb_core::storage::{Storage, StorageConfig};
use std::path::PathBuf;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ringdb", about = "RingDB time-series database daemon", version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "RINGDB_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Allocate a new database and exit
    #[arg(long, conflicts_with_all = ["create_test", "delete"])]
    create: bool,

    /// Allocate a small database suitable for tests and exit
    #[arg(long, conflicts_with = "delete")]
    create_test: bool,

    /// Delete the database and exit
    #[arg(long)]
    delete: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    let storage_config = config.to_storage_config()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    if args.delete {
        Storage::delete(&config.data_dir).context("deleting database")?;
        return Ok(());
    }
    if args.create || args.create_test {
        let storage_config = if args.create_test {
            StorageConfig {
                data_dir: storage_config.data_dir.clone(),
                wal: storage_config.wal.clone(),
                ..StorageConfig::test_defaults()
            }
        } else {
            storage_config
        };
        Storage::create(&storage_config).context("creating database")?;
        info!(
            "Created database at {:?}: {} volumes of {} bytes",
            storage_config.data_dir, storage_config.nvolumes, storage_config.volume_size
        );
        return Ok(());
    }

    info!("Starting RingDB server...");
    info!("Data directory: {:?}", config.data_dir);

    // recovery finishes before any socket accepts traffic
    let storage = Storage::open(storage_config).context("opening database")?;

    let tcp_listener = TcpListener::bind(config.tcp.addr)
        .await
        .with_context(|| format!("binding TCP {}", config.tcp.addr))?;
    let udp_socket = UdpSocket::bind(config.udp.addr)
        .await
        .with_context(|| format!("binding UDP {}", config.udp.addr))?;
    let http_listener = TcpListener::bind(config.http.addr)
        .await
        .with_context(|| format!("binding HTTP {}", config.http.addr))?;

    let cancel = CancellationToken::new();
    let tcp_task = tokio::spawn(tcp::serve(tcp_listener, storage.clone(), cancel.clone()));
    let udp_task = tokio::spawn(udp::serve(udp_socket, storage.clone(), cancel.clone()));

    let app = api::create_router(storage.clone());
    info!("HTTP API listening on {}", config.http.addr);
    let http_cancel = cancel.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    let _ = tcp_task.await;
    let _ = udp_task.await;
    match http_task.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tokio::task::spawn_blocking(move || storage.shutdown())
        .await?
        .context("final commit")?;
    info!("RingDB server shut down gracefully");

    Ok(())
}
