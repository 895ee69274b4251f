//! rpcbusd — the rpcbus daemon.
//!
//! Binds a TCP listener, accepts node connections, and routes envelopes
//! between them until interrupted.

use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use rpcbus_broker::{Broker, BrokerConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rpcbusd", version, about = "Message daemon routing calls between nodes")]
struct Cli {
    /// Address to listen on.
    #[arg(short = 'i', long = "host", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(short = 'p', long = "port", default_value_t = 5000)]
    port: u16,
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing_stderr();
    let cli = Cli::parse();

    let config = BrokerConfig {
        listen_addr: SocketAddr::new(cli.host, cli.port),
    };
    let broker = Broker::start(config).await?;
    info!(addr = %broker.local_addr(), "rpcbusd listening");

    wait_for_signal().await;
    broker.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::warn!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = term.recv() => info!("terminated"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupted");
}
