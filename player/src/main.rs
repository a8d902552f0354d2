//! Sendspin player - CLI binary.
//!
//! Connects to a Sendspin server (given or discovered via mDNS), receives
//! the group's audio stream, and plays it in sync through the system audio
//! device.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use sendspin_common::{init_tracing, MetricsContext, MetricsServerConfig};
use sendspin_player::{
    AutoConnectPolicy, CpalSink, DiscoveryAdapter, MemoryRecentServers, NullSink, Player,
    PlayerConfig, RecentServersStore, SinkFactory,
};

/// Sendspin Player - synchronized multi-room audio client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Server WebSocket URL (e.g. ws://host:8927/sendspin);
    /// omit to auto-connect to the first discovered server
    #[arg(short, long)]
    server: Option<String>,

    /// Client identifier presented to the server
    #[arg(long, default_value = "android-player-1")]
    client_id: String,

    /// Client name shown by controllers
    #[arg(short = 'n', long, default_value = "Android Player")]
    name: String,

    /// Playout offset in milliseconds; negative plays earlier
    #[arg(short, long, default_value = "-300", allow_hyphen_values = true)]
    playout_offset_ms: i32,

    /// Bind address for the Prometheus scrape endpoint, e.g. 127.0.0.1:9100
    #[arg(long)]
    metrics_bind: Option<std::net::SocketAddr>,

    /// Discard audio instead of opening a device (for diagnostics)
    #[arg(long)]
    null_audio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing()?;

    let args = Args::parse();
    info!("Starting Sendspin player");
    info!("Client: {} ({})", args.name, args.client_id);
    info!("Playout offset: {}ms", args.playout_offset_ms);

    let metrics = MetricsContext::new("player").context("failed to create metrics")?;
    if let Some(bind) = args.metrics_bind {
        metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
        info!("Metrics on http://{}/metrics", bind);
    }

    let config = PlayerConfig {
        client_id: args.client_id,
        client_name: args.name,
        playout_offset_ms: args.playout_offset_ms,
        ..Default::default()
    };

    let sink_factory: SinkFactory = if args.null_audio {
        Box::new(|| Box::new(NullSink::new()))
    } else {
        Box::new(|| Box::new(CpalSink::new()))
    };

    let mut player =
        Player::with_metrics(config, sink_factory, metrics).context("failed to start player")?;

    match args.server {
        Some(url) => {
            info!("Connecting to {}", url);
            player.connect(&url);

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
        }
        None => {
            info!("No server given; discovering...");
            let mut discovery =
                DiscoveryAdapter::start().context("failed to start mDNS discovery")?;

            let recent: Arc<dyn RecentServersStore> = Arc::new(MemoryRecentServers::new());
            let mut policy = AutoConnectPolicy::new(player.handle(), recent);

            loop {
                tokio::select! {
                    event = discovery.recv() => match event {
                        Some(event) => policy.on_event(event),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            discovery.shutdown();
        }
    }

    info!("Shutting down");
    player.disconnect();
    player.release();

    Ok(())
}
