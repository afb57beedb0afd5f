//! routing-balancer demo client
//!
//! Loads a client configuration, resolves the configured service through an
//! in-memory registry and picks a connection on a fixed interval, logging
//! which node every pick lands on.
//!
//! # Architecture Overview
//!
//! ```text
//!   config.toml ──▶ ConfigWatcher ──▶ MemoryRegistry
//!                                          │ list / subscribe
//!                                          ▼
//!                                  DiscoveryResolver
//!                                          │ full address sets
//!                                          ▼
//!   pick loop ──▶ Channel ──▶ RoutingBalancer ──▶ TcpSubConn × N
//!      ▲             │              │
//!      │             │              └─ rebuilds RoutingPicker on state changes
//!      └─────────────┴─ PickResult (node, address)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use routing_balancer::balancer::{BalancerRegistry, DoneInfo, PickInfo, RoutingIntent};
use routing_balancer::client::{ChannelOptions, ClientPool};
use routing_balancer::config::{load_config, sync_instances, ClientConfig, ConfigWatcher};
use routing_balancer::discovery::{MemoryRegistry, Registry};
use routing_balancer::lifecycle::signals::wait_for_signal;
use routing_balancer::observability::{logging, metrics};
use routing_balancer::transport::tcp::TcpConnector;
use routing_balancer::transport::ConnectivityState;

#[derive(Parser)]
#[command(name = "routing-balancer")]
#[command(about = "Pick connections for a service with optional node routing", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Route every pick to this node id
    #[arg(long)]
    prefer: Option<String>,

    /// Avoid this node id when another is available
    #[arg(long)]
    exclude: Option<String>,

    /// Milliseconds between picks
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("routing-balancer v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let registry = Arc::new(MemoryRegistry::new());
    sync_instances(&registry, &config)?;

    // Keep the watcher alive for the lifetime of the process.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let registry = registry.clone();
            tokio::spawn(async move {
                while let Some(updated) = updates.recv().await {
                    if let Err(e) = sync_instances(&registry, &updated) {
                        tracing::warn!(error = %e, "Failed to apply reloaded instances");
                    }
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let pool = ClientPool::new(
        registry.clone(),
        Arc::new(TcpConnector::from_config(&config.transport)),
        BalancerRegistry::with_defaults(),
        ChannelOptions::from_config(&config),
        |channel| channel,
    );
    let channel = pool.get(&config.discovery.service)?;

    tracing::info!(
        service = %config.discovery.service,
        policy = %config.balancer.policy,
        instances = config.discovery.instances.len(),
        "Channel ready for picks"
    );

    let mut intent = RoutingIntent::default();
    if let Some(node) = &cli.prefer {
        intent = intent.with_preferred_node(node.as_str());
    }
    if let Some(node) = &cli.exclude {
        intent = intent.with_excluded_node(node.as_str());
    }
    let info = PickInfo::new("/routing_balancer.Demo/Pick").with_intent(intent);

    let mut ticker = tokio::time::interval(Duration::from_millis(cli.interval_ms.max(1)));
    let signal = wait_for_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = ticker.tick() => match channel.pick(&info) {
                Ok(result) => {
                    tracing::info!(
                        node = %result.node_id,
                        addr = %result.sub_conn.address(),
                        sub_conn = %result.id,
                        "Picked connection"
                    );
                    result.finish(DoneInfo { success: true });
                }
                Err(e) => {
                    tracing::warn!(error = %e, retryable = e.is_retryable(), "Pick failed");
                }
            },
            _ = &mut signal => break,
        }
    }

    pool.close();
    channel
        .wait_for_state(ConnectivityState::Shutdown, Duration::from_secs(2))
        .await;
    registry.close().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
