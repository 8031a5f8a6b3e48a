use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ConnectionId, ConnectionStatus, UserId};

/// A durable message row as stored and as delivered by the change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Correlation token echoed back from the insert payload. Absent on
    /// rows written by clients that predate the token column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Insert payload for a durable write. The store assigns `id` and the
/// authoritative `created_at` and echoes `client_ref` verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub client_ref: Uuid,
}

/// One edge of the connection graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub requester_id: UserId,
    pub recipient_id: UserId,
    pub status: ConnectionStatus,
}

impl ConnectionRecord {
    /// The party that is not `user`, if `user` is on this edge at all.
    pub fn other_party(&self, user: UserId) -> Option<UserId> {
        if self.requester_id == user {
            Some(self.recipient_id)
        } else if self.recipient_id == user {
            Some(self.requester_id)
        } else {
            None
        }
    }
}

/// Directory metadata for a messageable peer. Read-only here; owned by the
/// profile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub university: Option<String>,
}

/// One participant's heartbeat entry on the presence channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}
