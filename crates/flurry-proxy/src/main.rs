//! flurry-proxy: standalone volunteer relay proxy.

use anyhow::Context;
use clap::Parser;
use flurry_proxy::broker::BrokerClient;
use flurry_proxy::config::{Overrides, ProxyConfig};
use flurry_proxy::context::ProxyContext;
use flurry_proxy::orchestrator::Orchestrator;
use flurry_proxy::peer::WebRtcPeerFactory;
use flurry_proxy::relay::WebSocketDialer;
use flurry_proxy::report::LogReporter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Volunteer relay proxy
#[derive(Parser, Debug)]
#[command(name = "flurry-proxy", version, about = "Volunteer WebRTC-to-WebSocket relay proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.flurry/config.toml")]
    config: String,

    /// Broker URL
    #[arg(long)]
    broker: Option<String>,

    /// Default relay host
    #[arg(long)]
    relay_host: Option<String>,

    /// Default relay port
    #[arg(long)]
    relay_port: Option<u16>,

    /// Pattern broker-supplied relay hosts must match (`^` for exact)
    #[arg(long)]
    allowed_relay_pattern: Option<String>,

    /// Maximum concurrent clients
    #[arg(long)]
    capacity: Option<usize>,

    /// Aggregate bandwidth cap in bytes per second
    #[arg(long)]
    rate_limit: Option<u64>,

    /// Skip the NAT self-test
    #[arg(long)]
    no_nat_probe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting flurry-proxy");

    let overrides = Overrides {
        broker: cli.broker,
        relay_host: cli.relay_host,
        relay_port: cli.relay_port,
        allowed_relay_pattern: cli.allowed_relay_pattern,
        max_clients: cli.capacity,
        rate_limit: cli.rate_limit,
        disable_nat_probe: cli.no_nat_probe,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ProxyConfig::load(Some(&config_path), &overrides)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    info!(
        broker = %config.broker_url,
        relay = %config.relay_host,
        capacity = config.max_clients,
        rate_limit = ?config.rate_limit_bytes,
        "configuration loaded"
    );

    let signaling = BrokerClient::new(&config).context("failed to create broker client")?;
    let peers = WebRtcPeerFactory::new(&config.ice_servers).context("failed to set up WebRTC")?;
    let ctx = ProxyContext::new(
        config,
        Arc::new(signaling),
        Arc::new(peers),
        Arc::new(WebSocketDialer::new()),
        Arc::new(LogReporter::new()),
    );

    let orchestrator = Orchestrator::spawn(ctx);

    shutdown_signal().await;
    info!("received shutdown signal");

    orchestrator
        .shutdown()
        .await
        .context("orchestrator stopped unexpectedly")?;

    info!("flurry-proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
