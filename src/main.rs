use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};

use livelink::broadcast::BroadcastCoordinator;
use livelink::config::Config;
use livelink::media::MediaSource;
use livelink::relay::memory::MemoryRelay;
use livelink::viewer::registry::JoinRegistry;
use livelink::viewer::ViewingSession;
use livelink::{log, signal};

#[derive(Parser)]
#[command(version)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
    /// Number of loopback viewers to attach
    #[arg(long, default_value_t = 1)]
    viewers: usize,
}

#[tokio::main]
async fn main() -> livelink::result::Result<()> {
    let args = Args::parse();
    let cfg = Config::load(args.config);
    cfg.validate()?;

    log::set(format!("livelink={},webrtc=error", cfg.log.level));
    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);

    // Loopback demo: broadcaster and viewers share one in-memory relay.
    let relay = Arc::new(MemoryRelay::new());
    let source = MediaSource::synthetic("demo");
    let coordinator = BroadcastCoordinator::new(
        "demo",
        "broadcaster",
        relay.clone(),
        relay.clone(),
        source.tracks(),
        &cfg,
    )
    .await?;
    coordinator.start().await?;

    let registry = JoinRegistry::new();
    let mut viewers = Vec::with_capacity(args.viewers);
    for i in 0..args.viewers {
        let viewer = ViewingSession::new(
            "demo",
            format!("viewer-{i}"),
            "broadcaster",
            relay.clone(),
            relay.clone(),
            registry.clone(),
            &cfg,
        );
        viewer.join().await?;
        viewers.push(viewer);
    }

    let reason = signal::wait_for_stop_signal().await;
    info!("received signal {}, shutting down", reason);

    for viewer in &viewers {
        viewer.leave().await?;
    }
    coordinator.stop().await?;
    Ok(())
}
