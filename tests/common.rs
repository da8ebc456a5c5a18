use std::sync::Arc;

use tokio::time::{timeout, Duration};

use livelink::broadcast::BroadcastCoordinator;
use livelink::config::Config;
use livelink::media::MediaSource;
use livelink::relay::memory::MemoryRelay;
use livelink::viewer::registry::JoinRegistry;
use livelink::viewer::{ViewerState, ViewingSession};

pub const BROADCAST: &str = "it-broadcast";
pub const BROADCASTER: &str = "broadcaster";

/// Local loopback only: host candidates are enough, remote ICE servers
/// would just slow gathering down.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ice_servers.clear();
    config.signaling.poll_interval_ms = 25;
    config.signaling.heartbeat_interval_ms = 50;
    config.signaling.stats_interval_ms = 50;
    config
}

pub async fn start_broadcast(
    relay: Arc<MemoryRelay>,
    source: &MediaSource,
) -> BroadcastCoordinator {
    let coordinator = BroadcastCoordinator::new(
        BROADCAST,
        BROADCASTER,
        relay.clone(),
        relay,
        source.tracks(),
        &test_config(),
    )
    .await
    .unwrap();
    coordinator.start().await.unwrap();
    coordinator
}

pub fn new_viewer(
    relay: Arc<MemoryRelay>,
    viewer_id: &str,
    registry: JoinRegistry,
) -> ViewingSession {
    ViewingSession::new(
        BROADCAST,
        viewer_id,
        BROADCASTER,
        relay.clone(),
        relay,
        registry,
        &test_config(),
    )
}

pub async fn wait_for_state(viewer: &ViewingSession, want: ViewerState, secs: u64) {
    let mut rx = viewer.state();
    timeout(Duration::from_secs(secs), async move {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("viewer never reached {:?}", want));
}
