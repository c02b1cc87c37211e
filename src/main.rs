use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use finops_gateway::bridge::McpBridgeFactory;
use finops_gateway::config::Config;
use finops_gateway::metrics;
use finops_gateway::outbox::ToolOutputStore;
use finops_gateway::registry::SessionRegistry;

const HEARTBEAT_SECS: u64 = 30;

/// FinOps Gateway - session broker for per-account tool subprocesses
#[derive(Parser, Debug)]
#[command(name = "finops-gateway", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    info!(
        service = %config.service_name,
        bridge_command = %config.bridge.command,
        "finops gateway starting"
    );

    let metrics = metrics::shared();
    let factory = Arc::new(McpBridgeFactory::new(config.bridge.clone()));
    let registry = Arc::new(
        SessionRegistry::new(
            factory,
            config.sessions.max_sessions,
            config.sessions.idle_timeout(),
        )
        .with_metrics(metrics.clone()),
    );
    let outbox = ToolOutputStore::new();

    info!("gateway ready, entering main loop");

    let mut sweep_interval = tokio::time::interval(config.sessions.sweep_interval());
    sweep_interval.tick().await;
    let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat_interval.tick().await;

    loop {
        tokio::select! {
            // Idle session sweep and expired outbox entries
            _ = sweep_interval.tick() => {
                let expired = registry.sweep_idle().await;
                let swept = outbox.sweep().await;
                if expired > 0 || swept > 0 {
                    info!(sessions = expired, outputs = swept, "sweep complete");
                }
            }
            // Periodic metrics heartbeat
            _ = heartbeat_interval.tick() => {
                let snapshot = {
                    let mut m = metrics::lock(&metrics);
                    m.increment_uptime(HEARTBEAT_SECS);
                    m.update_memory();
                    let rate = m.tool_success_rate();
                    m.set_custom("tool_success_rate", rate);
                    serde_json::to_string(&*m)
                };
                match snapshot {
                    Ok(snapshot) => info!(
                        sessions = registry.active_count().await,
                        metrics = %snapshot,
                        "heartbeat"
                    ),
                    Err(e) => warn!(error = %e, "failed to serialize metrics"),
                }
            }
            // Graceful shutdown
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("shutdown signal received, stopping sessions"),
                    Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
                }
                registry.shutdown().await;
                break;
            }
        }
    }

    info!("finops gateway stopped");
    Ok(())
}
