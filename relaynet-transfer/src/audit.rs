//! Per-peer counters accumulated while processing frames, used to decide
//! when a peer should be flagged for abuse.

use crate::frame::PeerAuditMessage;
use std::sync::atomic::{AtomicU64, Ordering};

/// Abuse counters for a single peer, updated from many concurrent tasks.
#[derive(Debug, Default)]
pub struct PeerAudit {
    bad_contract: AtomicU64,
    discarded_bytes: AtomicU64,
    discarded_count: AtomicU64,
    bad_message_bytes: AtomicU64,
    bad_message_count: AtomicU64,
    sent_bytes: AtomicU64,
    sent_count: AtomicU64,
    resent_bytes: AtomicU64,
    resent_count: AtomicU64,
    abuse: AtomicU64,
}

impl PeerAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_bad_contract(&self) {
        self.bad_contract.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, bytes: u64) {
        self.discarded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.discarded_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bad_message(&self, bytes: u64) {
        self.bad_message_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.bad_message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.sent_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resent(&self, bytes: u64) {
        self.resent_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.resent_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abuse(&self) {
        self.abuse.fetch_add(1, Ordering::Relaxed);
    }

    /// `true` once a peer has accumulated enough bad traffic that callers
    /// should stop serving it. The threshold mirrors the teacher crate's
    /// blackhole-detection margin: any recorded abuse event, or a
    /// bad-message count that outweighs everything sent successfully.
    pub fn is_abusive(&self) -> bool {
        self.abuse.load(Ordering::Relaxed) > 0
            || self.bad_message_count.load(Ordering::Relaxed)
                > self.sent_count.load(Ordering::Relaxed).max(1) * 4
    }

    pub fn snapshot(&self) -> PeerAuditMessage {
        PeerAuditMessage {
            bad_contract: self.bad_contract.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            discarded_count: self.discarded_count.load(Ordering::Relaxed),
            bad_message_bytes: self.bad_message_bytes.load(Ordering::Relaxed),
            bad_message_count: self.bad_message_count.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_count: self.sent_count.load(Ordering::Relaxed),
            resent_bytes: self.resent_bytes.load(Ordering::Relaxed),
            resent_count: self.resent_count.load(Ordering::Relaxed),
            abuse: self.abuse.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_audit_is_not_abusive() {
        let audit = PeerAudit::new();
        assert!(!audit.is_abusive());
    }

    #[test]
    fn single_abuse_event_flags_peer() {
        let audit = PeerAudit::new();
        audit.record_abuse();
        assert!(audit.is_abusive());
    }

    #[test]
    fn lopsided_bad_message_ratio_flags_peer() {
        let audit = PeerAudit::new();
        audit.record_sent(100);
        for _ in 0..5 {
            audit.record_bad_message(10);
        }
        assert!(audit.is_abusive());
    }

    #[test]
    fn snapshot_reflects_counters() {
        let audit = PeerAudit::new();
        audit.record_sent(50);
        audit.record_resent(20);
        let snap = audit.snapshot();
        assert_eq!(snap.sent_bytes, 50);
        assert_eq!(snap.resent_bytes, 20);
    }
}
