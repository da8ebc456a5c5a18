use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppError;
use crate::relay::{
    BroadcastRecord, BroadcastStatus, BroadcastStore, PresenceRecord, PresenceStore,
    SignalEnvelope, SignalRelay,
};
use crate::result::Result;

struct EnvelopeRow {
    envelope: SignalEnvelope,
    consumed: bool,
}

/// In-process implementation of all three relay contracts, used by the demo
/// binary and as the test double. Rows keep insertion order, which breaks
/// `created_at` ties the same way a serial database id would.
#[derive(Default)]
pub struct MemoryRelay {
    envelopes: RwLock<Vec<EnvelopeRow>>,
    presence: RwLock<Vec<PresenceRecord>>,
    broadcasts: RwLock<HashMap<String, BroadcastRecord>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn insert(&self, envelope: SignalEnvelope) -> Result<()> {
        let mut envelopes = self.envelopes.write().await;
        envelopes.push(EnvelopeRow {
            envelope,
            consumed: false,
        });
        Ok(())
    }

    async fn select_unconsumed(
        &self,
        broadcast_id: &str,
        to: &str,
    ) -> Result<Vec<SignalEnvelope>> {
        let envelopes = self.envelopes.read().await;
        let mut rows: Vec<SignalEnvelope> = envelopes
            .iter()
            .filter(|row| {
                !row.consumed
                    && row.envelope.broadcast_id == broadcast_id
                    && row.envelope.to == to
            })
            .map(|row| row.envelope.clone())
            .collect();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }

    async fn mark_consumed(&self, id: Uuid) -> Result<()> {
        let mut envelopes = self.envelopes.write().await;
        if let Some(row) = envelopes.iter_mut().find(|row| row.envelope.id == id) {
            row.consumed = true;
        }
        Ok(())
    }

    async fn delete_all(&self, broadcast_id: &str, identity: &str) -> Result<()> {
        let mut envelopes = self.envelopes.write().await;
        envelopes.retain(|row| {
            row.envelope.broadcast_id != broadcast_id
                || (row.envelope.from != identity && row.envelope.to != identity)
        });
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryRelay {
    async fn upsert_presence(
        &self,
        broadcast_id: &str,
        viewer_id: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let mut presence = self.presence.write().await;
        if let Some(record) = presence
            .iter_mut()
            .find(|r| r.broadcast_id == broadcast_id && r.viewer_id == viewer_id)
        {
            record.last_seen = last_seen;
        } else {
            presence.push(PresenceRecord {
                broadcast_id: broadcast_id.to_string(),
                viewer_id: viewer_id.to_string(),
                last_seen,
            });
        }
        Ok(())
    }

    async fn delete_presence(&self, broadcast_id: &str, viewer_id: &str) -> Result<()> {
        let mut presence = self.presence.write().await;
        presence.retain(|r| !(r.broadcast_id == broadcast_id && r.viewer_id == viewer_id));
        Ok(())
    }

    async fn count_recent_presence(
        &self,
        broadcast_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize> {
        let presence = self.presence.read().await;
        Ok(presence
            .iter()
            .filter(|r| r.broadcast_id == broadcast_id && r.last_seen >= since)
            .count())
    }
}

#[async_trait]
impl BroadcastStore for MemoryRelay {
    async fn create_broadcast(&self, id: &str, owner: &str) -> Result<()> {
        let mut broadcasts = self.broadcasts.write().await;
        broadcasts.entry(id.to_string()).or_insert(BroadcastRecord {
            id: id.to_string(),
            owner: owner.to_string(),
            status: BroadcastStatus::Idle,
            last_heartbeat: None,
            viewer_count: 0,
        });
        Ok(())
    }

    async fn set_status(&self, id: &str, status: BroadcastStatus) -> Result<()> {
        let mut broadcasts = self.broadcasts.write().await;
        match broadcasts.get_mut(id) {
            Some(record) => {
                record.status = status;
                Ok(())
            }
            None => Err(AppError::broadcast_not_found(id)),
        }
    }

    async fn update_heartbeat(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        viewer_count: u64,
    ) -> Result<()> {
        let mut broadcasts = self.broadcasts.write().await;
        match broadcasts.get_mut(id) {
            Some(record) => {
                record.last_heartbeat = Some(timestamp);
                record.viewer_count = viewer_count;
                Ok(())
            }
            None => Err(AppError::broadcast_not_found(id)),
        }
    }

    async fn get_broadcast(&self, id: &str) -> Result<Option<BroadcastRecord>> {
        let broadcasts = self.broadcasts.read().await;
        Ok(broadcasts.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::relay::SignalKind;

    fn envelope(from: &str, to: &str, kind: SignalKind) -> SignalEnvelope {
        SignalEnvelope::new("b1", from, to, kind, json!({}))
    }

    #[tokio::test]
    async fn test_mark_consumed_is_at_most_once() {
        let relay = MemoryRelay::new();
        let env = envelope("v1", "host", SignalKind::ViewerJoin);
        let id = env.id;
        relay.insert(env).await.unwrap();

        let fetched = relay.select_unconsumed("b1", "host").await.unwrap();
        assert_eq!(fetched.len(), 1);

        relay.mark_consumed(id).await.unwrap();
        assert!(relay.select_unconsumed("b1", "host").await.unwrap().is_empty());

        // idempotent
        relay.mark_consumed(id).await.unwrap();
        assert!(relay.select_unconsumed("b1", "host").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_orders_by_created_at() {
        let relay = MemoryRelay::new();
        let now = Utc::now();

        let mut answer = envelope("v1", "host", SignalKind::Answer);
        answer.created_at = now + Duration::milliseconds(20);
        let mut cand1 = envelope("v1", "host", SignalKind::IceCandidate);
        cand1.created_at = now;
        let mut cand2 = envelope("v1", "host", SignalKind::IceCandidate);
        cand2.created_at = now + Duration::milliseconds(10);

        // insert out of creation order
        relay.insert(answer).await.unwrap();
        relay.insert(cand2).await.unwrap();
        relay.insert(cand1).await.unwrap();

        let fetched = relay.select_unconsumed("b1", "host").await.unwrap();
        let kinds: Vec<SignalKind> = fetched.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SignalKind::IceCandidate,
                SignalKind::IceCandidate,
                SignalKind::Answer
            ]
        );
    }

    #[tokio::test]
    async fn test_select_filters_recipient() {
        let relay = MemoryRelay::new();
        relay
            .insert(envelope("host", "v1", SignalKind::Offer))
            .await
            .unwrap();
        relay
            .insert(envelope("host", "v2", SignalKind::Offer))
            .await
            .unwrap();

        let for_v1 = relay.select_unconsumed("b1", "v1").await.unwrap();
        assert_eq!(for_v1.len(), 1);
        assert_eq!(for_v1[0].to, "v1");
    }

    #[tokio::test]
    async fn test_delete_all_removes_both_directions() {
        let relay = MemoryRelay::new();
        relay
            .insert(envelope("v1", "host", SignalKind::ViewerJoin))
            .await
            .unwrap();
        relay
            .insert(envelope("host", "v1", SignalKind::Offer))
            .await
            .unwrap();
        relay
            .insert(envelope("host", "v2", SignalKind::Offer))
            .await
            .unwrap();

        relay.delete_all("b1", "v1").await.unwrap();

        assert!(relay.select_unconsumed("b1", "host").await.unwrap().is_empty());
        assert!(relay.select_unconsumed("b1", "v1").await.unwrap().is_empty());
        assert_eq!(relay.select_unconsumed("b1", "v2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_presence_upsert_keeps_one_row() {
        let relay = MemoryRelay::new();
        let t0 = Utc::now();
        relay.upsert_presence("b1", "v1", t0).await.unwrap();
        relay
            .upsert_presence("b1", "v1", t0 + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(relay.count_recent_presence("b1", t0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_presence_window_and_delete() {
        let relay = MemoryRelay::new();
        let now = Utc::now();
        relay
            .upsert_presence("b1", "stale", now - Duration::seconds(60))
            .await
            .unwrap();
        relay.upsert_presence("b1", "fresh", now).await.unwrap();

        let since = now - Duration::seconds(10);
        assert_eq!(relay.count_recent_presence("b1", since).await.unwrap(), 1);

        relay.delete_presence("b1", "fresh").await.unwrap();
        assert_eq!(relay.count_recent_presence("b1", since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_lifecycle() {
        let relay = MemoryRelay::new();
        relay.create_broadcast("b1", "host").await.unwrap();

        let record = relay.get_broadcast("b1").await.unwrap().unwrap();
        assert_eq!(record.status, BroadcastStatus::Idle);
        assert!(record.last_heartbeat.is_none());

        relay.set_status("b1", BroadcastStatus::Active).await.unwrap();
        relay.update_heartbeat("b1", Utc::now(), 3).await.unwrap();

        let record = relay.get_broadcast("b1").await.unwrap().unwrap();
        assert_eq!(record.status, BroadcastStatus::Active);
        assert_eq!(record.viewer_count, 3);
        assert!(record.last_heartbeat.is_some());

        assert!(relay
            .update_heartbeat("missing", Utc::now(), 0)
            .await
            .is_err());
    }
}
