use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;
use webrtc::track::track_local::TrackLocal;

use crate::broadcast::internal::CoordinatorInternal;
use crate::config::Config;
use crate::error::AppError;
use crate::relay::{BroadcastStatus, BroadcastStore, SignalRelay};
use crate::result::Result;

mod internal;

/// The broadcaster side of a broadcast: owns one signaling session per
/// viewer, answers join announcements with offers, and keeps the broadcast
/// record's heartbeat fresh.
pub struct BroadcastCoordinator {
    internal: Arc<CoordinatorInternal>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl BroadcastCoordinator {
    /// Registers the broadcast record in `Idle` status. `start` flips it to
    /// `Active` and begins signaling.
    pub async fn new(
        broadcast_id: impl ToString,
        owner_id: impl ToString,
        relay: Arc<dyn SignalRelay>,
        broadcasts: Arc<dyn BroadcastStore>,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        config: &Config,
    ) -> Result<Self> {
        if tracks.is_empty() {
            return Err(AppError::media_access("no local media tracks"));
        }
        let broadcast_id = broadcast_id.to_string();
        let owner_id = owner_id.to_string();
        broadcasts.create_broadcast(&broadcast_id, &owner_id).await?;
        Ok(BroadcastCoordinator {
            internal: Arc::new(CoordinatorInternal::new(
                broadcast_id,
                owner_id,
                relay,
                broadcasts,
                config.rtc_ice_servers(),
                tracks,
            )),
            poll_handle: Mutex::new(None),
            heartbeat_handle: Mutex::new(None),
            poll_interval: Duration::from_millis(config.signaling.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(config.signaling.heartbeat_interval_ms),
        })
    }

    pub fn broadcast_id(&self) -> &str {
        &self.internal.broadcast_id
    }

    /// Marks the broadcast `Active` and starts the poll and heartbeat loops.
    /// Calling it on an already started coordinator is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.poll_handle.lock().unwrap().is_some() {
            return Ok(());
        }
        self.internal
            .broadcasts
            .set_status(&self.internal.broadcast_id, BroadcastStatus::Active)
            .await?;

        let internal = self.internal.clone();
        let interval = self.poll_interval;
        let poll = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let internal = internal.clone();
                // a slow fetch must never delay the next tick
                tokio::spawn(async move { internal.poll_once().await });
            }
        });
        *self.poll_handle.lock().unwrap() = Some(poll);

        let internal = self.internal.clone();
        let interval = self.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let internal = internal.clone();
                tokio::spawn(async move { internal.heartbeat_once().await });
            }
        });
        *self.heartbeat_handle.lock().unwrap() = Some(heartbeat);

        info!(broadcast = self.internal.broadcast_id, "broadcast started");
        Ok(())
    }

    /// Stops the loops, closes every viewer session, and marks the broadcast
    /// `Ended`. Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.internal.drain_sessions().await;
        self.internal
            .broadcasts
            .set_status(&self.internal.broadcast_id, BroadcastStatus::Ended)
            .await?;
        info!(broadcast = self.internal.broadcast_id, "broadcast stopped");
        Ok(())
    }

    /// Forcibly closes one viewer's session. The viewer may announce a fresh
    /// join afterwards and will get a brand new session.
    pub async fn kick(&self, viewer_id: &str) -> Result<()> {
        if self.internal.remove_session(viewer_id).await {
            Ok(())
        } else {
            Err(AppError::session_not_found(viewer_id))
        }
    }

    pub async fn session_count(&self) -> usize {
        self.internal.session_count().await
    }

    /// Connected viewers right now, the same number heartbeats report.
    pub async fn viewer_count(&self) -> u64 {
        self.internal.connected_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryRelay;
    use crate::rtc;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn video_track() -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            rtc::VIDEO_KIND.to_owned(),
            "test".to_owned(),
        ))
    }

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.ice_servers.clear();
        config.signaling.poll_interval_ms = 50;
        config.signaling.heartbeat_interval_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_new_requires_tracks() {
        let relay = Arc::new(MemoryRelay::new());
        let result = BroadcastCoordinator::new(
            "b1",
            "host",
            relay.clone(),
            relay,
            Vec::new(),
            &offline_config(),
        )
        .await;
        assert!(matches!(result, Err(AppError::MediaAccess(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_status_transitions() {
        let relay = Arc::new(MemoryRelay::new());
        let coordinator = BroadcastCoordinator::new(
            "b1",
            "host",
            relay.clone(),
            relay.clone(),
            vec![video_track()],
            &offline_config(),
        )
        .await
        .unwrap();

        let record = relay.get_broadcast("b1").await.unwrap().unwrap();
        assert_eq!(record.status, BroadcastStatus::Idle);

        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();
        let record = relay.get_broadcast("b1").await.unwrap().unwrap();
        assert_eq!(record.status, BroadcastStatus::Active);

        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();
        let record = relay.get_broadcast("b1").await.unwrap().unwrap();
        assert_eq!(record.status, BroadcastStatus::Ended);
    }

    #[tokio::test]
    async fn test_kick_unknown_viewer() {
        let relay = Arc::new(MemoryRelay::new());
        let coordinator = BroadcastCoordinator::new(
            "b1",
            "host",
            relay.clone(),
            relay,
            vec![video_track()],
            &offline_config(),
        )
        .await
        .unwrap();
        let err = coordinator.kick("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
        assert_eq!(err.to_string(), "session not found: ghost");
    }
}
