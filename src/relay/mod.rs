use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::Result;

pub mod memory;

/// One unit of signaling data exchanged through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    ViewerJoin,
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::ViewerJoin => write!(f, "viewer-join"),
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

/// Immutable once created. The consumed flag lives in the store, set exactly
/// once by the recipient after processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub id: Uuid,
    pub broadcast_id: String,
    pub from: String,
    pub to: String,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SignalEnvelope {
    pub fn new(
        broadcast_id: impl ToString,
        from: impl ToString,
        to: impl ToString,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        SignalEnvelope {
            id: Uuid::new_v4(),
            broadcast_id: broadcast_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// A viewer's "still watching" liveness marker, independent of transport
/// connection state. At most one live record per (broadcast, viewer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub broadcast_id: String,
    pub viewer_id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Idle,
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub id: String,
    pub owner: String,
    pub status: BroadcastStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub viewer_count: u64,
}

/// Ordered, at-least-once, point-to-point message delivery between two named
/// endpoints. The default backing is a polled row store; a push-based channel
/// can be substituted without touching the components above it.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    async fn insert(&self, envelope: SignalEnvelope) -> Result<()>;

    /// Unconsumed envelopes addressed to `to`, ordered by `created_at`
    /// ascending. Ordering only matters within a (from, to) pair.
    async fn select_unconsumed(&self, broadcast_id: &str, to: &str)
        -> Result<Vec<SignalEnvelope>>;

    /// Idempotent.
    async fn mark_consumed(&self, id: Uuid) -> Result<()>;

    /// Removes every envelope on the broadcast where `identity` is the sender
    /// or the recipient. Clears leftovers from a prior uncleanly-ended
    /// session.
    async fn delete_all(&self, broadcast_id: &str, identity: &str) -> Result<()>;
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn upsert_presence(
        &self,
        broadcast_id: &str,
        viewer_id: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_presence(&self, broadcast_id: &str, viewer_id: &str) -> Result<()>;

    /// Auxiliary UX signal only. The heartbeat viewer count comes from
    /// connected sessions, not from here.
    async fn count_recent_presence(
        &self,
        broadcast_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize>;
}

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    async fn create_broadcast(&self, id: &str, owner: &str) -> Result<()>;

    async fn set_status(&self, id: &str, status: BroadcastStatus) -> Result<()>;

    async fn update_heartbeat(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        viewer_count: u64,
    ) -> Result<()>;

    async fn get_broadcast(&self, id: &str) -> Result<Option<BroadcastRecord>>;
}
