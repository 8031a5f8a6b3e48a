//! Online-peer tracking fed by full-state snapshots.
//!
//! The presence channel broadcasts complete membership snapshots, not
//! diffs; every snapshot replaces the whole set. Modelling it as a pure
//! snapshot-to-set function keeps the tracker immune to drift.

use std::collections::HashSet;

use shared::{domain::UserId, protocol::PresenceRecord};
use tokio::sync::RwLock;

/// Recomputes the online set from scratch for one snapshot.
pub fn online_set(records: &[PresenceRecord]) -> HashSet<UserId> {
    records.iter().map(|record| record.user_id).collect()
}

/// Shared read-only view of who is online. Written only by the presence
/// sync task; readable by any UI needing an online indicator.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: RwLock<HashSet<UserId>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole set; membership changes are never additive.
    pub async fn apply_snapshot(&self, records: &[PresenceRecord]) -> HashSet<UserId> {
        let online = online_set(records);
        *self.online.write().await = online.clone();
        online
    }

    pub async fn clear(&self) {
        self.online.write().await.clear();
    }

    pub async fn is_online(&self, peer: UserId) -> bool {
        self.online.read().await.contains(&peer)
    }

    pub async fn snapshot(&self) -> HashSet<UserId> {
        self.online.read().await.clone()
    }
}
