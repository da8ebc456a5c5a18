use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{Config, Signaling};
use crate::convert;
use crate::relay::{PresenceStore, SignalEnvelope, SignalKind, SignalRelay};
use crate::result::Result;
use crate::session::{SessionState, SignalingSession, StateNotify};
use crate::viewer::quality::{ConnectionQuality, QualityStats};
use crate::viewer::registry::JoinRegistry;

pub mod quality;
pub mod registry;

/// `Error` is pre-negotiation failure (join never completed), `Failed` is
/// post-negotiation transport failure. A manual retry is `leave()` + `join()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Connecting,
    Connected,
    Failed,
    Error,
}

/// One viewer's participation in one broadcast: presence registration,
/// signal polling, the single signaling session, and quality monitoring.
pub struct ViewingSession {
    internal: Arc<ViewerInternal>,
    state_rx: watch::Receiver<ViewerState>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    stats_handle: Mutex<Option<JoinHandle<()>>>,
}

struct ViewerInternal {
    broadcast_id: String,
    viewer_id: String,
    broadcaster_id: String,
    relay: Arc<dyn SignalRelay>,
    presence: Arc<dyn PresenceStore>,
    ice_servers: Vec<RTCIceServer>,
    signaling: Signaling,
    session: RwLock<Option<Arc<SignalingSession>>>,
    state_tx: Arc<watch::Sender<ViewerState>>,
    quality: Arc<QualityStats>,
    registry: JoinRegistry,
}

impl ViewingSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broadcast_id: impl ToString,
        viewer_id: impl ToString,
        broadcaster_id: impl ToString,
        relay: Arc<dyn SignalRelay>,
        presence: Arc<dyn PresenceStore>,
        registry: JoinRegistry,
        config: &Config,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ViewerState::Connecting);
        ViewingSession {
            internal: Arc::new(ViewerInternal {
                broadcast_id: broadcast_id.to_string(),
                viewer_id: viewer_id.to_string(),
                broadcaster_id: broadcaster_id.to_string(),
                relay,
                presence,
                ice_servers: config.rtc_ice_servers(),
                signaling: config.signaling.clone(),
                session: RwLock::new(None),
                state_tx: Arc::new(state_tx),
                quality: Arc::new(QualityStats::new()),
                registry,
            }),
            state_rx,
            poll_handle: Mutex::new(None),
            stats_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<ViewerState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ViewerState {
        *self.state_rx.borrow()
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.internal.quality.classify()
    }

    /// Registers presence, announces the join, and starts the poll loops.
    /// A duplicate join for a pair that is already initializing is skipped.
    pub async fn join(&self) -> Result<()> {
        let internal = &self.internal;
        if !internal
            .registry
            .try_insert(&internal.broadcast_id, &internal.viewer_id)
        {
            debug!(
                broadcast = internal.broadcast_id,
                viewer = internal.viewer_id,
                "already initializing, skipping join"
            );
            return Ok(());
        }
        match self.join_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                internal
                    .registry
                    .remove(&internal.broadcast_id, &internal.viewer_id);
                let _ = internal.state_tx.send(ViewerState::Error);
                Err(e)
            }
        }
    }

    async fn join_inner(&self) -> Result<()> {
        let internal = &self.internal;

        // A prior session that ended uncleanly may have left records behind.
        internal
            .presence
            .delete_presence(&internal.broadcast_id, &internal.viewer_id)
            .await?;
        internal
            .relay
            .delete_all(&internal.broadcast_id, &internal.viewer_id)
            .await?;

        internal
            .presence
            .upsert_presence(&internal.broadcast_id, &internal.viewer_id, Utc::now())
            .await?;
        internal
            .relay
            .insert(SignalEnvelope::new(
                &internal.broadcast_id,
                &internal.viewer_id,
                &internal.broadcaster_id,
                SignalKind::ViewerJoin,
                serde_json::json!({}),
            ))
            .await?;
        let _ = internal.state_tx.send(ViewerState::Connecting);
        info!(
            broadcast = internal.broadcast_id,
            viewer = internal.viewer_id,
            "joined broadcast"
        );

        let poll = Self::spawn_poll_loop(
            internal.clone(),
            Duration::from_millis(internal.signaling.poll_interval_ms),
        );
        *self.poll_handle.lock().unwrap() = Some(poll);
        let stats = Self::spawn_stats_loop(
            internal.clone(),
            Duration::from_millis(internal.signaling.stats_interval_ms),
        );
        *self.stats_handle.lock().unwrap() = Some(stats);
        Ok(())
    }

    /// Stops loops, tears down the session, and deregisters presence.
    /// Safe to call any number of times, including without a prior join.
    pub async fn leave(&self) -> Result<()> {
        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.stats_handle.lock().unwrap().take() {
            handle.abort();
        }
        let internal = &self.internal;
        let session = internal.session.write().await.take();
        if let Some(session) = session {
            let _ = session.close().await;
        }
        if let Err(e) = internal
            .presence
            .delete_presence(&internal.broadcast_id, &internal.viewer_id)
            .await
        {
            warn!(error = %e, "failed to delete presence on leave");
        }
        internal
            .registry
            .remove(&internal.broadcast_id, &internal.viewer_id);
        Ok(())
    }

    fn spawn_poll_loop(internal: Arc<ViewerInternal>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let internal = internal.clone();
                // a slow fetch must never delay the next tick
                tokio::spawn(async move { internal.poll_once().await });
            }
        })
    }

    fn spawn_stats_loop(internal: Arc<ViewerInternal>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let session = internal.session.read().await.clone();
                if let Some(session) = session {
                    if session.is_connected().await {
                        session.sample_stats(&internal.quality).await;
                        if internal.quality.classify() == ConnectionQuality::Poor {
                            warn!(
                                loss = format!("{:.2}%", internal.quality.loss_percentage()),
                                "poor connection quality"
                            );
                        }
                    }
                }
            }
        })
    }
}

impl ViewerInternal {
    async fn poll_once(self: Arc<Self>) {
        let envelopes = match self
            .relay
            .select_unconsumed(&self.broadcast_id, &self.viewer_id)
            .await
        {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "viewer poll failed, skipping tick");
                return;
            }
        };
        for envelope in envelopes {
            if let Err(e) = self.handle_envelope(&envelope).await {
                warn!(kind = %envelope.kind, error = %e, "failed to process envelope");
            }
            // consumed regardless of the outcome, a poison envelope must not
            // block the queue
            if let Err(e) = self.relay.mark_consumed(envelope.id).await {
                warn!(error = %e, "failed to mark envelope consumed");
            }
        }
        if let Err(e) = self
            .presence
            .upsert_presence(&self.broadcast_id, &self.viewer_id, Utc::now())
            .await
        {
            warn!(error = %e, "presence refresh failed");
        }
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: &SignalEnvelope) -> Result<()> {
        match envelope.kind {
            SignalKind::Offer => {
                let session = self.session_or_create().await;
                session
                    .handle_offer(convert::offer_from_payload(&envelope.payload)?)
                    .await
            }
            SignalKind::IceCandidate => {
                let session = self.session.read().await.clone();
                match session {
                    Some(session) => {
                        session
                            .add_remote_candidate(convert::candidate_from_payload(
                                &envelope.payload,
                            )?)
                            .await
                    }
                    None => {
                        debug!("candidate before any offer, discarding");
                        Ok(())
                    }
                }
            }
            kind => {
                debug!(%kind, "unexpected signal kind addressed to viewer");
                Ok(())
            }
        }
    }

    async fn session_or_create(self: &Arc<Self>) -> Arc<SignalingSession> {
        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            return session.clone();
        }
        let state_tx = self.state_tx.clone();
        let notify: StateNotify = Arc::new(move |state| match state {
            SessionState::Connected => {
                let _ = state_tx.send(ViewerState::Connected);
            }
            SessionState::Failed | SessionState::Disconnected => {
                let _ = state_tx.send(ViewerState::Failed);
            }
            _ => {}
        });
        let session = SignalingSession::new(
            &self.broadcast_id,
            &self.viewer_id,
            &self.broadcaster_id,
            self.relay.clone(),
            self.ice_servers.clone(),
            notify,
        );
        *guard = Some(session.clone());
        session
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::relay::memory::MemoryRelay;
    use crate::AppError;

    fn test_viewer(relay: Arc<MemoryRelay>, registry: JoinRegistry) -> ViewingSession {
        let mut config = Config::default();
        config.ice_servers.clear();
        config.signaling.poll_interval_ms = 50;
        ViewingSession::new(
            "b1",
            "v1",
            "host",
            relay.clone(),
            relay,
            registry,
            &config,
        )
    }

    #[tokio::test]
    async fn test_duplicate_join_is_skipped() {
        let relay = Arc::new(MemoryRelay::new());
        let viewer = test_viewer(relay.clone(), JoinRegistry::new());

        viewer.join().await.unwrap();
        viewer.join().await.unwrap();

        let joins = relay.select_unconsumed("b1", "host").await.unwrap();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].kind, SignalKind::ViewerJoin);

        viewer.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_without_join_is_a_no_op() {
        let relay = Arc::new(MemoryRelay::new());
        let viewer = test_viewer(relay, JoinRegistry::new());
        viewer.leave().await.unwrap();
        viewer.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_after_leave_clears_stale_state() {
        let relay = Arc::new(MemoryRelay::new());
        let registry = JoinRegistry::new();
        let viewer = test_viewer(relay.clone(), registry.clone());

        viewer.join().await.unwrap();
        viewer.leave().await.unwrap();
        assert!(!registry.contains("b1", "v1"));

        viewer.join().await.unwrap();
        // the stale join envelope was cleared, only the fresh one remains
        let joins = relay.select_unconsumed("b1", "host").await.unwrap();
        assert_eq!(joins.len(), 1);
        assert_eq!(
            relay
                .count_recent_presence("b1", Utc::now() - chrono::Duration::seconds(5))
                .await
                .unwrap(),
            1
        );
        viewer.leave().await.unwrap();
    }

    struct FailingRelay;

    #[async_trait]
    impl SignalRelay for FailingRelay {
        async fn insert(&self, _envelope: SignalEnvelope) -> crate::result::Result<()> {
            Err(AppError::throw("relay down"))
        }
        async fn select_unconsumed(
            &self,
            _broadcast_id: &str,
            _to: &str,
        ) -> crate::result::Result<Vec<SignalEnvelope>> {
            Err(AppError::throw("relay down"))
        }
        async fn mark_consumed(&self, _id: Uuid) -> crate::result::Result<()> {
            Err(AppError::throw("relay down"))
        }
        async fn delete_all(
            &self,
            _broadcast_id: &str,
            _identity: &str,
        ) -> crate::result::Result<()> {
            Err(AppError::throw("relay down"))
        }
    }

    #[tokio::test]
    async fn test_failed_join_releases_the_registry_entry() {
        let presence = Arc::new(MemoryRelay::new());
        let registry = JoinRegistry::new();
        let mut config = Config::default();
        config.ice_servers.clear();
        let viewer = ViewingSession::new(
            "b1",
            "v1",
            "host",
            Arc::new(FailingRelay),
            presence,
            registry.clone(),
            &config,
        );

        assert!(viewer.join().await.is_err());
        assert_eq!(viewer.current_state(), ViewerState::Error);
        assert!(!registry.contains("b1", "v1"));

        // the pair is free to try again
        assert!(viewer.join().await.is_err());
        assert!(!registry.contains("b1", "v1"));
    }
}
