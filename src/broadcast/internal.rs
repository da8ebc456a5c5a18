use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::track::track_local::TrackLocal;

use crate::convert;
use crate::relay::{BroadcastStore, SignalEnvelope, SignalKind, SignalRelay};
use crate::result::Result;
use crate::session::{SessionState, SignalingSession, StateNotify};

pub(crate) struct CoordinatorInternal {
    pub(crate) broadcast_id: String,
    pub(crate) owner_id: String,
    pub(crate) relay: Arc<dyn SignalRelay>,
    pub(crate) broadcasts: Arc<dyn BroadcastStore>,
    pub(crate) ice_servers: Vec<RTCIceServer>,
    pub(crate) tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    sessions: RwLock<HashMap<String, Arc<SignalingSession>>>,
}

impl CoordinatorInternal {
    pub(crate) fn new(
        broadcast_id: String,
        owner_id: String,
        relay: Arc<dyn SignalRelay>,
        broadcasts: Arc<dyn BroadcastStore>,
        ice_servers: Vec<RTCIceServer>,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Self {
        CoordinatorInternal {
            broadcast_id,
            owner_id,
            relay,
            broadcasts,
            ice_servers,
            tracks,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn poll_once(self: Arc<Self>) {
        let envelopes = match self
            .relay
            .select_unconsumed(&self.broadcast_id, &self.owner_id)
            .await
        {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "broadcaster poll failed, skipping tick");
                return;
            }
        };
        for envelope in envelopes {
            if let Err(e) = self.dispatch(&envelope).await {
                warn!(kind = %envelope.kind, from = envelope.from, error = %e, "failed to process envelope");
            }
            // consumed regardless of the outcome, a poison envelope must not
            // block the queue
            if let Err(e) = self.relay.mark_consumed(envelope.id).await {
                warn!(error = %e, "failed to mark envelope consumed");
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: &SignalEnvelope) -> Result<()> {
        match envelope.kind {
            SignalKind::ViewerJoin => self.create_session(&envelope.from).await,
            SignalKind::Answer => {
                let session = self.sessions.read().await.get(&envelope.from).cloned();
                match session {
                    Some(session) => {
                        session
                            .handle_answer(convert::answer_from_payload(&envelope.payload)?)
                            .await
                    }
                    None => {
                        debug!(viewer = envelope.from, "answer for unknown session, discarding");
                        Ok(())
                    }
                }
            }
            SignalKind::IceCandidate => {
                let session = self.sessions.read().await.get(&envelope.from).cloned();
                match session {
                    Some(session) => {
                        session
                            .add_remote_candidate(convert::candidate_from_payload(
                                &envelope.payload,
                            )?)
                            .await
                    }
                    None => {
                        debug!(viewer = envelope.from, "candidate for unknown session, discarding");
                        Ok(())
                    }
                }
            }
            kind => {
                debug!(%kind, "unexpected signal kind addressed to broadcaster");
                Ok(())
            }
        }
    }

    /// One session per viewer. A repeat join while a session exists is a
    /// duplicate poll artifact and is ignored.
    async fn create_session(self: &Arc<Self>, viewer_id: &str) -> Result<()> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(viewer_id) {
                debug!(viewer = viewer_id, "session already exists, ignoring join");
                return Ok(());
            }
        }
        let weak = Arc::downgrade(self);
        let owned_viewer = viewer_id.to_string();
        let notify: StateNotify = Arc::new(move |state| {
            if matches!(state, SessionState::Failed | SessionState::Disconnected) {
                if let Some(internal) = weak.upgrade() {
                    let viewer = owned_viewer.clone();
                    tokio::spawn(async move {
                        internal.remove_session(&viewer).await;
                    });
                }
            }
        });
        let session = SignalingSession::new(
            &self.broadcast_id,
            &self.owner_id,
            viewer_id,
            self.relay.clone(),
            self.ice_servers.clone(),
            notify,
        );
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(viewer_id) {
                return Ok(());
            }
            sessions.insert(viewer_id.to_string(), session.clone());
        }
        if let Err(e) = session.open_as_offerer(&self.tracks).await {
            self.sessions.write().await.remove(viewer_id);
            return Err(e);
        }
        info!(
            broadcast = self.broadcast_id,
            viewer = viewer_id,
            "viewer session created"
        );
        Ok(())
    }

    pub(crate) async fn remove_session(&self, viewer_id: &str) -> bool {
        let session = self.sessions.write().await.remove(viewer_id);
        match session {
            Some(session) => {
                let _ = session.close().await;
                info!(
                    broadcast = self.broadcast_id,
                    viewer = viewer_id,
                    "viewer session removed"
                );
                true
            }
            None => false,
        }
    }

    pub(crate) async fn drain_sessions(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in sessions {
            let _ = session.close().await;
        }
    }

    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Viewers with a connected transport, the number reported by heartbeats.
    pub(crate) async fn connected_count(&self) -> u64 {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut count = 0;
        for session in sessions {
            if session.is_connected().await {
                count += 1;
            }
        }
        count
    }

    pub(crate) async fn heartbeat_once(self: Arc<Self>) {
        let viewers = self.connected_count().await;
        if let Err(e) = self
            .broadcasts
            .update_heartbeat(&self.broadcast_id, Utc::now(), viewers)
            .await
        {
            warn!(error = %e, "heartbeat update failed");
        } else {
            debug!(broadcast = self.broadcast_id, viewers, "heartbeat");
        }
    }
}
