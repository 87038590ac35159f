#![warn(missing_docs)]

//! `kv-get`: fetches one document over the binary protocol.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kvclient_core::{Core, CoreConfig, ResponseStatus};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kv-get")]
#[command(about = "Fetch a document from a key-value node", long_about = None)]
struct Cli {
    /// Node address.
    #[arg(short, long, default_value = "127.0.0.1:11210", env = "KV_ADDR")]
    addr: String,

    /// Partition (vbucket) the key lives in.
    #[arg(short, long, default_value = "0")]
    partition: u16,

    /// Request timeout in milliseconds; overrides the configured default.
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// TOML or JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the core metrics as JSON after the request.
    #[arg(long)]
    metrics: bool,

    /// Document key.
    key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CoreConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoreConfig::default(),
    };
    let timeout = cli
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.kv_timeout());

    let core = Core::connect(config, &cli.addr)
        .await
        .with_context(|| format!("connecting to {}", cli.addr))?;
    let outcome = match core.get(cli.key.clone(), cli.partition, timeout) {
        Ok(handle) => handle.recv().await,
        Err(e) => Err(e),
    };

    if cli.metrics {
        println!("{}", serde_json::to_string_pretty(&core.metrics())?);
    }
    core.shutdown();

    let response = outcome.with_context(|| format!("GET {}", cli.key))?;
    match response.status {
        ResponseStatus::Success => {
            tracing::debug!(cas = response.cas, flags = response.flags, "document found");
            println!("{}", String::from_utf8_lossy(&response.content));
            Ok(())
        }
        status => anyhow::bail!("GET {} failed with status {:?}", cli.key, status),
    }
}
