//! Acknowledgment tracking and retransmission.
//!
//! Every outbound DATA packet is tracked until its ACK arrives. The engine
//! never reads a clock itself: callers pass `now`, so the endpoint's tick
//! drives it in production and tests drive it with synthetic instants.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::packet::Packet;

/// A DATA packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingAck {
    /// The packet, resent verbatim on timeout.
    pub packet: Packet,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
    /// Retransmissions performed so far.
    pub retries: u32,
}

impl PendingAck {
    /// Track a packet transmitted at `now`.
    pub fn new(packet: Packet, now: Instant) -> Self {
        Self {
            packet,
            sent_at: now,
            retries: 0,
        }
    }

    /// Check if the retransmission timeout has elapsed.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.sent_at) >= timeout
    }

    /// Time of the next expiry.
    pub fn deadline(&self, timeout: Duration) -> Instant {
        self.sent_at + timeout
    }
}

/// A packet that ran out of retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Sequence of the unacknowledged packet.
    pub sequence: u32,
    /// Message the packet belongs to.
    pub message_id: u32,
    /// Retransmissions performed before giving up.
    pub retries: u32,
}

/// Result of one retransmission scan.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Packets to resend now.
    pub retransmit: Vec<Packet>,
    /// Set when a packet exhausted its budget; the session is dead.
    pub failed: Option<DeliveryFailure>,
}

/// Per-session retransmission state.
#[derive(Debug)]
pub struct ReliabilityEngine {
    pending: BTreeMap<u32, PendingAck>,
    timeout: Duration,
    max_retries: u32,
}

impl ReliabilityEngine {
    /// Create an engine with the given retransmission timeout and budget.
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            timeout,
            max_retries,
        }
    }

    /// Start tracking a packet sent at `now`.
    pub fn track(&mut self, packet: Packet, now: Instant) {
        self.pending
            .insert(packet.sequence(), PendingAck::new(packet, now));
    }

    /// Remove the entry for `sequence`.
    ///
    /// Returns `None` for unknown sequences (stale or duplicate ACKs).
    pub fn acknowledge(&mut self, sequence: u32) -> Option<PendingAck> {
        self.pending.remove(&sequence)
    }

    /// Scan for expired entries.
    ///
    /// An expired entry with budget left is resent and its timer restarted.
    /// An expired entry that was already retransmitted `max_retries` times
    /// fails the session, and no further retransmissions are produced.
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        for pending in self.pending.values_mut() {
            if !pending.is_expired(now, self.timeout) {
                continue;
            }
            if pending.retries >= self.max_retries {
                outcome.retransmit.clear();
                outcome.failed = Some(DeliveryFailure {
                    sequence: pending.packet.sequence(),
                    message_id: pending.packet.message_id(),
                    retries: pending.retries,
                });
                return outcome;
            }
            pending.retries += 1;
            pending.sent_at = now;
            outcome.retransmit.push(pending.packet.clone());
        }

        outcome
    }

    /// Earliest time `poll` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|pending| pending.deadline(self.timeout))
            .min()
    }

    /// Number of unacknowledged packets.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Check if a sequence is awaiting acknowledgment.
    pub fn is_pending(&self, sequence: u32) -> bool {
        self.pending.contains_key(&sequence)
    }

    /// Drop all tracked packets.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
