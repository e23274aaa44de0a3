//! RingDB CLI - client and functional check harness

mod checks;
mod client;
mod harness;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client::{sample_frame, Client};
use harness::retry;
use ringdb_core::time::{parse_duration, parse_timestamp};
use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ringdb-cli")]
#[command(about = "RingDB client and functional check harness")]
#[command(version)]
struct Args {
    /// HTTP API base URL
    #[arg(long, default_value = "http://127.0.0.1:8181", env = "RINGDB_HTTP")]
    http: String,

    /// TCP ingestion address
    #[arg(long, default_value = "127.0.0.1:8282", env = "RINGDB_TCP")]
    tcp: SocketAddr,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a run of samples to one series
    Write {
        /// Series name, e.g. `cpu host=A`
        series: String,
        /// Number of samples
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// First timestamp (`YYYYMMDDThhmmss[.fraction]`), default now
        #[arg(long)]
        start: Option<String>,
        /// Distance between samples
        #[arg(long, default_value = "1s")]
        step: String,
    },
    /// Run a JSON query and print the response (`-` reads stdin)
    Query {
        query: String,
    },
    /// Print volume statistics
    Stats,
    /// Run the functional check suite against a freshly created database
    Check {
        /// Samples in the main data set
        #[arg(short = 'n', long, default_value_t = 1000)]
        samples: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = Client::new(&args.http, args.tcp)?;

    match args.command {
        Commands::Write {
            series,
            count,
            start,
            step,
        } => {
            let start = match start {
                Some(ts) => parse_timestamp(&ts)?,
                None => chrono::Utc::now()
                    .timestamp_nanos_opt()
                    .context("clock out of range")?,
            };
            let step = parse_duration(&step)?;
            let frames: String = (0..count)
                .map(|i| sample_frame(&series, start + i as i64 * step, i as f64))
                .collect();
            let reply = client.send(&frames).await?;
            if !reply.is_empty() {
                bail!("server rejected frames:\n{}", reply.trim_end());
            }
            println!("{} samples written", count);
        }
        Commands::Query { query } => {
            let text = if query == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                query
            };
            let query: serde_json::Value =
                serde_json::from_str(&text).context("query is not valid JSON")?;
            print!("{}", client.query(&query).await?);
        }
        Commands::Stats => {
            let stats = client.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Check { samples } => {
            if samples < 200 || samples % 100 != 0 {
                bail!("--samples must be a multiple of 100, at least 200");
            }
            // the daemon may still be recovering
            retry(
                || client.stats(),
                10,
                Duration::from_millis(250),
                1.5,
                |e: &anyhow::Error| {
                    e.downcast_ref::<reqwest::Error>()
                        .map_or(false, |e| e.is_connect() || e.is_timeout())
                },
            )
            .await
            .context("server is not reachable")?;

            let run = checks::run_all(&client, samples).await;
            println!("{} checks passed, {} failed", run.passed(), run.failed());
            for (name, reason) in run.failures() {
                println!("  {}: {}", name, reason);
            }
            if !run.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
