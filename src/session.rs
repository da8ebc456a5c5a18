use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::convert;
use crate::relay::{SignalEnvelope, SignalKind, SignalRelay};
use crate::result::Result;
use crate::rtc;
use crate::viewer::quality::QualityStats;
use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

/// Invoked on every transport-driven state transition. Owners use this to
/// retire dead sessions and to track connected counts.
pub type StateNotify = Arc<dyn Fn(SessionState) + Send + Sync>;

/// Drives exactly one peer connection for one (broadcaster, viewer) pairing:
/// local connection events become outbound envelopes, inbound envelopes
/// become connection-state transitions. The peer handle is owned here and
/// never shared.
pub struct SignalingSession {
    broadcast_id: String,
    local_id: String,
    remote_id: String,
    relay: Arc<dyn SignalRelay>,
    ice_servers: Vec<RTCIceServer>,
    notify: StateNotify,
    peer: RwLock<Option<Arc<RTCPeerConnection>>>,
    state: RwLock<SessionState>,
    // Candidates that arrived before the remote description was set. Flushed
    // in arrival order as soon as it lands.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl SignalingSession {
    pub fn new(
        broadcast_id: impl ToString,
        local_id: impl ToString,
        remote_id: impl ToString,
        relay: Arc<dyn SignalRelay>,
        ice_servers: Vec<RTCIceServer>,
        notify: StateNotify,
    ) -> Arc<Self> {
        Arc::new(SignalingSession {
            broadcast_id: broadcast_id.to_string(),
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            relay,
            ice_servers,
            notify,
            peer: RwLock::new(None),
            state: RwLock::new(SessionState::New),
            pending_candidates: Mutex::new(Vec::new()),
        })
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == SessionState::Connected
    }

    /// Broadcaster side: create the peer, attach every local track, send the
    /// offer. Candidates trickle out one envelope each as they are gathered.
    pub async fn open_as_offerer(
        self: &Arc<Self>,
        tracks: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<()> {
        if self.state().await != SessionState::New {
            return Err(AppError::throw("session already opened"));
        }
        let peer = self.new_session_peer().await?;
        for track in tracks {
            let sender = peer.add_track(track.clone()).await?;
            // Keep the sender's RTCP stream drained so interceptors run.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }
        *self.peer.write().await = Some(peer.clone());

        let offer = peer.create_offer(None).await?;
        // The offer envelope goes out before gathering starts so that no
        // trickled candidate can precede it in created_at order.
        self.send(SignalKind::Offer, convert::offer_payload(&offer)?)
            .await?;
        peer.set_local_description(offer).await?;
        *self.state.write().await = SessionState::HaveLocalOffer;
        info!(
            broadcast = self.broadcast_id,
            viewer = self.remote_id,
            "offer sent"
        );
        Ok(())
    }

    /// Viewer side: negotiate against an inbound offer, answering through the
    /// relay. Creates the peer lazily on the first offer.
    pub async fn handle_offer(self: &Arc<Self>, offer: RTCSessionDescription) -> Result<()> {
        let state = self.state().await;
        if !matches!(state, SessionState::New | SessionState::HaveRemoteOffer) {
            debug!(?state, "discarding offer");
            return Ok(());
        }
        let peer = {
            let existing = self.peer.read().await.clone();
            match existing {
                Some(peer) => peer,
                None => {
                    let peer = self.new_session_peer().await?;
                    peer.on_track(Box::new(move |track, _, _| {
                        debug!(kind = %track.kind(), "remote track up");
                        Box::pin(async {})
                    }));
                    *self.peer.write().await = Some(peer.clone());
                    peer
                }
            }
        };
        peer.set_remote_description(offer).await?;
        *self.state.write().await = SessionState::HaveRemoteOffer;
        self.flush_pending_candidates(&peer).await;

        let answer = peer.create_answer(None).await?;
        self.send(SignalKind::Answer, convert::answer_payload(&answer)?)
            .await?;
        peer.set_local_description(answer).await?;
        info!(
            broadcast = self.broadcast_id,
            broadcaster = self.remote_id,
            "answer sent"
        );
        Ok(())
    }

    /// An answer is only ever applied in `HaveLocalOffer`. Duplicate or late
    /// answers are a no-op, not an error.
    pub async fn handle_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        let state = self.state().await;
        if state != SessionState::HaveLocalOffer {
            debug!(?state, viewer = self.remote_id, "discarding answer");
            return Ok(());
        }
        let peer = self
            .peer
            .read()
            .await
            .clone()
            .ok_or(AppError::session_not_found(&self.remote_id))?;
        peer.set_remote_description(answer).await?;
        self.flush_pending_candidates(&peer).await;
        Ok(())
    }

    /// Applies a remote candidate immediately when the remote description is
    /// set, otherwise buffers it for the flush that follows.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let peer = self.peer.read().await.clone();
        if let Some(peer) = peer {
            if peer.remote_description().await.is_some() {
                peer.add_ice_candidate(candidate).await?;
                return Ok(());
            }
        }
        debug!(remote = self.remote_id, "buffering early candidate");
        self.pending_candidates.lock().await.push(candidate);
        Ok(())
    }

    /// Explicit teardown. Safe to call any number of times.
    pub async fn close(&self) -> Result<()> {
        *self.state.write().await = SessionState::Closed;
        let peer = self.peer.write().await.take();
        if let Some(peer) = peer {
            let _ = peer.close().await;
        }
        Ok(())
    }

    /// Samples transport statistics into `stats`. No-op until a peer exists.
    pub async fn sample_stats(&self, stats: &QualityStats) {
        let peer = self.peer.read().await.clone();
        if let Some(peer) = peer {
            stats.update_from_stats(&peer.get_stats().await);
        }
    }

    async fn new_session_peer(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>> {
        let peer = rtc::new_peer(self.ice_servers.clone()).await?;

        let sess = Arc::downgrade(self);
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sess = sess.clone();
            Box::pin(async move {
                if let (Some(candidate), Some(sess)) = (candidate, sess.upgrade()) {
                    sess.send_local_candidate(candidate).await;
                }
            })
        }));

        let sess = Arc::downgrade(self);
        peer.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sess = sess.clone();
            Box::pin(async move {
                if let Some(sess) = sess.upgrade() {
                    sess.on_transport_state(s).await;
                }
            })
        }));

        Ok(peer)
    }

    async fn on_transport_state(&self, transport: RTCPeerConnectionState) {
        info!(
            broadcast = self.broadcast_id,
            remote = self.remote_id,
            state = %transport,
            "connection state changed"
        );
        let mapped = match transport {
            RTCPeerConnectionState::Connected => SessionState::Connected,
            RTCPeerConnectionState::Disconnected => SessionState::Disconnected,
            RTCPeerConnectionState::Failed => SessionState::Failed,
            RTCPeerConnectionState::Closed => SessionState::Closed,
            _ => return,
        };
        {
            let mut state = self.state.write().await;
            // A late transport event must not resurrect a torn-down session.
            if *state == SessionState::Closed && mapped == SessionState::Connected {
                return;
            }
            *state = mapped;
        }
        (self.notify)(mapped);
    }

    async fn send_local_candidate(&self, candidate: RTCIceCandidate) {
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(e) => {
                warn!(error = %e, "failed to marshal local candidate");
                return;
            }
        };
        let payload = match convert::candidate_payload(&init) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode candidate payload");
                return;
            }
        };
        if let Err(e) = self.send(SignalKind::IceCandidate, payload).await {
            warn!(error = %e, remote = self.remote_id, "failed to send candidate");
        }
    }

    async fn send(&self, kind: SignalKind, payload: serde_json::Value) -> Result<()> {
        self.relay
            .insert(SignalEnvelope::new(
                &self.broadcast_id,
                &self.local_id,
                &self.remote_id,
                kind,
                payload,
            ))
            .await
    }

    async fn flush_pending_candidates(&self, peer: &Arc<RTCPeerConnection>) {
        let pending: Vec<RTCIceCandidateInit> =
            self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(error = %e, remote = self.remote_id, "failed to apply buffered candidate");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::memory::MemoryRelay;

    fn test_session(relay: Arc<MemoryRelay>, local: &str, remote: &str) -> Arc<SignalingSession> {
        SignalingSession::new("b1", local, remote, relay, vec![], Arc::new(|_| {}))
    }

    fn host_candidate(port: u16) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:1 1 UDP 2130706431 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn scratch_offer() -> RTCSessionDescription {
        let peer = rtc::new_peer(vec![]).await.unwrap();
        peer.create_data_channel("probe", None).await.unwrap();
        let offer = peer.create_offer(None).await.unwrap();
        let _ = peer.close().await;
        offer
    }

    async fn scratch_answer() -> RTCSessionDescription {
        let offerer = rtc::new_peer(vec![]).await.unwrap();
        offerer.create_data_channel("probe", None).await.unwrap();
        let offer = offerer.create_offer(None).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();

        let answerer = rtc::new_peer(vec![]).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer(None).await.unwrap();

        let _ = offerer.close().await;
        let _ = answerer.close().await;
        answer
    }

    #[tokio::test]
    async fn test_answer_discarded_outside_have_local_offer() {
        let relay = Arc::new(MemoryRelay::new());
        let session = test_session(relay, "host", "v1");

        let answer = scratch_answer().await;
        session.handle_answer(answer).await.unwrap();

        assert_eq!(session.state().await, SessionState::New);
    }

    #[tokio::test]
    async fn test_early_candidates_buffered_then_flushed_on_offer() {
        let relay = Arc::new(MemoryRelay::new());
        let session = test_session(relay.clone(), "v1", "host");

        session
            .add_remote_candidate(host_candidate(50000))
            .await
            .unwrap();
        session
            .add_remote_candidate(host_candidate(50001))
            .await
            .unwrap();
        assert_eq!(session.pending_len().await, 2);

        let offer = scratch_offer().await;
        session.handle_offer(offer).await.unwrap();

        assert_eq!(session.pending_len().await, 0);
        assert_eq!(session.state().await, SessionState::HaveRemoteOffer);

        // the answer went back through the relay
        let outbound = relay.select_unconsumed("b1", "host").await.unwrap();
        assert!(outbound.iter().any(|e| e.kind == SignalKind::Answer));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let relay = Arc::new(MemoryRelay::new());
        let session = test_session(relay, "v1", "host");

        let offer = scratch_offer().await;
        session.handle_offer(offer).await.unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_offer_discarded_after_close() {
        let relay = Arc::new(MemoryRelay::new());
        let session = test_session(relay.clone(), "v1", "host");
        session.close().await.unwrap();

        let offer = scratch_offer().await;
        session.handle_offer(offer).await.unwrap();

        assert_eq!(session.state().await, SessionState::Closed);
        assert!(relay.select_unconsumed("b1", "host").await.unwrap().is_empty());
    }
}
