//! Per-peer unread counters behind the conversation-list badges.
//!
//! Unread state is coarse: counters only ever grow while a conversation is
//! inactive and are cleared wholesale when it becomes active. There is no
//! decrement and no per-message read tracking here.

use std::collections::HashMap;

use shared::domain::UserId;

#[derive(Debug, Default)]
pub struct UnreadLedger {
    counts: HashMap<UserId, u32>,
    active: Option<UserId>,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<UserId> {
        self.active
    }

    /// Marks `peer` as the active conversation (or none). The new active
    /// peer's counter is cleared; opening a conversation is the only
    /// operation that zeroes a counter.
    pub fn set_active(&mut self, peer: Option<UserId>) {
        self.active = peer;
        if let Some(peer) = peer {
            self.counts.remove(&peer);
        }
    }

    /// Bumps `peer`'s counter and returns the new value, or `None` when
    /// `peer` is the active conversation and the increment is suppressed.
    pub fn increment(&mut self, peer: UserId) -> Option<u32> {
        if self.active == Some(peer) {
            return None;
        }
        let count = self.counts.entry(peer).or_insert(0);
        *count += 1;
        Some(*count)
    }

    pub fn clear(&mut self, peer: UserId) {
        self.counts.remove(&peer);
    }

    pub fn count(&self, peer: UserId) -> u32 {
        self.counts.get(&peer).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<UserId, u32> {
        self.counts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_monotonic_while_inactive() {
        let mut ledger = UnreadLedger::new();
        for expected in 1..=5 {
            assert_eq!(ledger.increment(UserId(42)), Some(expected));
        }
        assert_eq!(ledger.count(UserId(42)), 5);
    }

    #[test]
    fn increments_for_the_active_peer_are_suppressed() {
        let mut ledger = UnreadLedger::new();
        ledger.set_active(Some(UserId(42)));
        assert_eq!(ledger.increment(UserId(42)), None);
        assert_eq!(ledger.count(UserId(42)), 0);
        assert_eq!(ledger.increment(UserId(7)), Some(1));
    }

    #[test]
    fn activating_a_peer_clears_its_counter() {
        let mut ledger = UnreadLedger::new();
        ledger.increment(UserId(42));
        ledger.increment(UserId(42));
        ledger.increment(UserId(7));
        ledger.set_active(Some(UserId(42)));
        assert_eq!(ledger.count(UserId(42)), 0);
        assert_eq!(ledger.count(UserId(7)), 1);
    }

    #[test]
    fn clear_resets_regardless_of_count() {
        let mut ledger = UnreadLedger::new();
        for _ in 0..9 {
            ledger.increment(UserId(3));
        }
        ledger.clear(UserId(3));
        assert_eq!(ledger.count(UserId(3)), 0);
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn deactivating_resumes_counting() {
        let mut ledger = UnreadLedger::new();
        ledger.set_active(Some(UserId(42)));
        assert_eq!(ledger.increment(UserId(42)), None);
        ledger.set_active(None);
        assert_eq!(ledger.increment(UserId(42)), Some(1));
    }
}
