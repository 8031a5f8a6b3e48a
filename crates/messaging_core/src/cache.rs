//! Ordered message buffer for the open conversation.
//!
//! The cache merges the history snapshot, optimistic local writes and
//! change-feed deliveries while keeping the list sorted by `created_at`
//! (insertion order breaks ties), keeping durable ids unique,
//! and guaranteeing that every provisional entry is removed exactly once,
//! either promoted to its confirmed record or rolled back.

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::MessageRecord,
};
use uuid::Uuid;

/// A message as held in memory. Provisional entries carry a UUID id and a
/// correlation token; confirmed entries carry the store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub image_url: Option<String>,
    pub client_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    pub fn from_record(record: MessageRecord) -> Self {
        Self {
            id: MessageId::Durable(record.id),
            sender_id: record.sender_id,
            recipient_id: record.recipient_id,
            content: record.content,
            image_url: record.image_url,
            client_ref: record.client_ref,
            created_at: record.created_at,
            read_at: record.read_at,
        }
    }
}

/// What `reconcile` did with a confirmed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A provisional entry with the matching correlation token was
    /// replaced in place.
    Promoted,
    /// A genuinely new record was inserted at its sorted position.
    Inserted,
    /// The durable id was already present; duplicate delivery, no-op.
    Duplicate,
}

#[derive(Debug)]
pub struct ConversationCache {
    peer_id: UserId,
    entries: Vec<Message>,
}

impl ConversationCache {
    pub fn new(peer_id: UserId) -> Self {
        Self {
            peer_id,
            entries: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges a point-in-time history snapshot. Confirmed rows already
    /// delivered by the feed dedupe away; outstanding provisional entries
    /// survive untouched (their write is still in flight).
    pub fn merge_history(&mut self, records: Vec<MessageRecord>) {
        for record in records {
            self.reconcile(record);
        }
    }

    /// Appends an optimistic entry immediately, at its sorted position.
    pub fn insert_provisional(&mut self, message: Message) {
        debug_assert!(message.is_provisional());
        self.insert_sorted(message);
    }

    /// Applies one confirmed record. Handles the echo of a local send, a
    /// genuine incoming message, and duplicate delivery; idempotent.
    pub fn reconcile(&mut self, record: MessageRecord) -> ReconcileOutcome {
        if let Some(token) = record.client_ref {
            let slot = self
                .entries
                .iter()
                .position(|m| m.is_provisional() && m.client_ref == Some(token));
            if let Some(slot) = slot {
                // Replace in place: the optimistic entry keeps its spot
                // even if the authoritative timestamp shifted slightly.
                self.entries[slot] = Message::from_record(record);
                return ReconcileOutcome::Promoted;
            }
        }

        let durable = MessageId::Durable(record.id);
        if self.entries.iter().any(|m| m.id == durable) {
            return ReconcileOutcome::Duplicate;
        }

        self.insert_sorted(Message::from_record(record));
        ReconcileOutcome::Inserted
    }

    /// Removes a provisional entry after a failed durable write. Returns
    /// false if it was already gone.
    pub fn rollback(&mut self, provisional_id: Uuid) -> bool {
        let id = MessageId::Provisional(provisional_id);
        let before = self.entries.len();
        self.entries.retain(|m| m.id != id);
        self.entries.len() != before
    }

    fn insert_sorted(&mut self, message: Message) {
        let at = self
            .entries
            .partition_point(|m| m.created_at <= message.created_at);
        self.entries.insert(at, message);
    }
}
