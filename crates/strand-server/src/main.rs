//! `strand-server` binary entrypoint.
//!
//! Loads configuration from `STRAND_*` environment variables, applies any
//! command-line overrides, and runs a history host until interrupted.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use strand_core::MemoryExecutionStore;
use strand_core::observability::{LogFormat, init_logging};
use strand_history::config::Config;
use strand_history::host::{Collaborators, Host};

/// Strand history service.
#[derive(Debug, Parser)]
#[command(name = "strand-server", version, about)]
struct Cli {
    /// Number of shards (overrides `STRAND_SHARD_COUNT`).
    #[arg(long)]
    shard_count: Option<u32>,

    /// Log format: `json` or `pretty` (overrides `STRAND_LOG_FORMAT`).
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Prometheus listen address (overrides `STRAND_METRICS_ADDR`).
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Cluster name used for replication (overrides `STRAND_CLUSTER_NAME`).
    #[arg(long)]
    cluster_name: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(count) = self.shard_count {
            config.shard_count = count;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = Some(addr);
        }
        if let Some(name) = self.cluster_name {
            config.replication.cluster_name = Some(name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    cli.apply(&mut config);

    init_logging(config.log_format);

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        tracing::info!(%addr, "serving metrics");
    }

    tracing::warn!("using in-memory execution store; state is lost on exit");
    let store = Arc::new(MemoryExecutionStore::new());

    let host = Host::build(config, store, Collaborators::default())
        .await
        .context("building history host")?;
    host.start().await.context("starting shard engines")?;
    tracing::info!("strand-server ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    host.shutdown().await;
    Ok(())
}
