use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use connlimit::config::{ConnLimitConfig, PolicyKind};
use connlimit::ratelimit::{PacketRateLimitProtocol, Protocol, TrafficRateLimitProtocol};
use connlimit::server::{EchoHandler, TcpServer, UdpServer};

/// Echo server with per-connection rate limiting.
#[derive(Debug, Parser)]
#[command(name = "connlimit", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP listen address
    #[arg(long)]
    tcp_addr: Option<std::net::SocketAddr>,

    /// UDP listen address
    #[arg(long)]
    udp_addr: Option<std::net::SocketAddr>,

    /// Metering policy
    #[arg(long, value_enum)]
    policy: Option<PolicyKind>,

    /// Default per-connection limit for the selected policy
    #[arg(long)]
    limit: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting connlimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ConnLimitConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.tcp_addr {
        config.server.tcp_addr = addr;
    }
    if cli.udp_addr.is_some() {
        config.server.udp_addr = cli.udp_addr;
    }
    if let Some(policy) = cli.policy {
        config.throttle.policy = policy;
    }
    if let Some(limit) = cli.limit {
        config.throttle.set_default_limit(limit);
    }
    config.validate()?;

    info!(
        tcp_addr = %config.server.tcp_addr,
        policy = ?config.throttle.policy,
        limit = config.throttle.default_limit(),
        overrides = config.throttle.overrides.len(),
        "Configuration loaded"
    );

    match config.throttle.policy {
        PolicyKind::Packet => {
            let protocol = PacketRateLimitProtocol::system();
            protocol.engine().set_default_limit(config.throttle.packet_limit)?;
            run(config, protocol).await?;
        }
        PolicyKind::Traffic => {
            let protocol = TrafficRateLimitProtocol::system();
            protocol.engine().set_default_limit(config.throttle.traffic_limit)?;
            run(config, protocol).await?;
        }
    }

    info!("connlimit stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Serve TCP, and UDP when configured, until a shutdown signal arrives.
async fn run<P: Protocol>(config: ConnLimitConfig, protocol: P) -> anyhow::Result<()> {
    let protocol = Arc::new(protocol);
    let handler = Arc::new(EchoHandler);
    let peer_limits = config.throttle.peer_limits();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tcp = TcpServer::bind(config.server.tcp_addr, protocol.clone(), handler.clone())
        .await?
        .with_peer_limits(peer_limits.clone())
        .with_max_frame_bytes(config.server.max_frame_bytes);
    let tcp_task = tokio::spawn(tcp.serve_with_shutdown(wait_for_shutdown(shutdown_rx.clone())));

    let udp_task = match config.server.udp_addr {
        Some(addr) => {
            let udp = UdpServer::bind(addr, protocol.clone(), handler.clone())
                .await?
                .with_peer_limits(peer_limits);
            Some(tokio::spawn(udp.serve_with_shutdown(wait_for_shutdown(shutdown_rx))))
        }
        None => None,
    };

    shutdown_signal().await;
    shutdown_tx.send_replace(true);

    tcp_task.await??;
    if let Some(task) = udp_task {
        task.await??;
    }
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
