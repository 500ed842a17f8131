//! Session state for the Cof transport.
//!
//! A [`Session`] is one logical conversation with one peer. It owns the
//! sequence counters, the reliability engine for its outbound DATA, the
//! reassembly buffer and the queue of delivered messages. It performs no
//! I/O: the endpoint feeds it packets and a clock, and sends whatever it
//! hands back.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::error::{TransportError, TransportResult};
use super::fragment::{self, Insert, Reassembler};
use super::packet::{Packet, SessionId};
use super::reliability::{PollOutcome, ReliabilityEngine};
use crate::core::TransportConfig;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, nothing exchanged yet.
    Init,
    /// Handshake exchange in flight.
    Handshaking,
    /// Both sides agree on the session id; data may flow.
    Established,
    /// Close in progress.
    Closing,
    /// Closed; the session is gone from its endpoint.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Handshaking => "HANDSHAKING",
            Self::Established => "ESTABLISHED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Packets for one outbound message, already tracked for retransmission.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Id shared by every fragment.
    pub message_id: u32,
    /// Packets to transmit, in fragment order.
    pub packets: Vec<Packet>,
}

/// What a DATA packet did to the session.
#[derive(Debug)]
pub enum DataOutcome {
    /// Stored; acknowledge it.
    Accepted {
        /// ACK to send back.
        ack: Packet,
        /// Messages newly queued for `receive`.
        delivered: usize,
    },
    /// Sequence seen before; acknowledge it again.
    Duplicate {
        /// ACK to send back.
        ack: Packet,
    },
    /// Dropped without an ACK, so the peer retransmits it later.
    Refused {
        /// Why it was not stored.
        reason: &'static str,
    },
}

/// One client/server conversation.
#[derive(Debug)]
pub struct Session {
    /// Session id assigned by the server.
    pub id: SessionId,
    /// Peer address.
    pub peer: SocketAddr,
    /// Lifecycle state.
    pub state: SessionState,
    /// Last inbound packet.
    pub last_activity: Instant,
    /// Client nonce that created the session, until the handshake settles.
    pub handshake_nonce: Option<u32>,

    max_payload: usize,
    /// Next outbound sequence.
    send_sequence: u64,
    /// Every inbound sequence below this has been received.
    recv_sequence: u64,
    /// Inbound sequences received above `recv_sequence`.
    received_above: BTreeSet<u64>,
    /// DATA at or beyond `recv_sequence + receive_window` is refused.
    receive_window: u64,

    reliability: ReliabilityEngine,
    /// Unacknowledged fragment count per outbound message.
    outbound: HashMap<u32, usize>,

    reassembly: Reassembler,
    /// Completed messages waiting for earlier ones: id -> (fragments, bytes).
    ready: BTreeMap<u64, (u16, Vec<u8>)>,
    /// Id of the next message to deliver.
    next_deliver: u64,
    inbox: VecDeque<Vec<u8>>,
    /// Bytes in `ready` and `inbox`.
    held: usize,
    max_buffered: usize,
}

/// DATA sequences start here in each direction.
const FIRST_SEQUENCE: u64 = 1;

/// Inbound window in sequences, shrunk so that a full window of packets
/// fits in the byte budget.
fn window(config: &TransportConfig) -> u64 {
    let packets = config.max_buffered_bytes / config.max_payload_size.max(1);
    u64::from(config.receive_window).min(packets.max(1) as u64)
}

impl Session {
    /// Create a session in `Init`.
    pub fn new(id: SessionId, peer: SocketAddr, config: &TransportConfig, now: Instant) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Init,
            last_activity: now,
            handshake_nonce: None,
            max_payload: config.max_payload_size,
            send_sequence: FIRST_SEQUENCE,
            recv_sequence: FIRST_SEQUENCE,
            received_above: BTreeSet::new(),
            receive_window: window(config),
            reliability: ReliabilityEngine::new(config.retransmit_timeout(), config.max_retries),
            outbound: HashMap::new(),
            reassembly: Reassembler::new(config.max_partial_messages),
            ready: BTreeMap::new(),
            next_deliver: FIRST_SEQUENCE,
            inbox: VecDeque::new(),
            held: 0,
            max_buffered: config.max_buffered_bytes,
        }
    }

    /// `Init` -> `Handshaking`.
    pub fn begin_handshake(&mut self, nonce: u32) {
        if self.state == SessionState::Init {
            self.state = SessionState::Handshaking;
            self.handshake_nonce = Some(nonce);
        }
    }

    /// Move to `Established`.
    ///
    /// Returns true only on the transition itself.
    pub fn establish(&mut self) -> bool {
        match self.state {
            SessionState::Init | SessionState::Handshaking => {
                self.state = SessionState::Established;
                true
            }
            _ => false,
        }
    }

    /// Check if data may flow.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Assign sequences to `message`, fragment it and track every packet.
    pub fn prepare_send(
        &mut self,
        message: &[u8],
        now: Instant,
    ) -> TransportResult<OutboundMessage> {
        if !self.is_established() {
            return Err(TransportError::SessionClosed);
        }

        let count = fragment::fragment_count(message.len(), self.max_payload);
        let end = self.send_sequence + count as u64;
        if end > u64::from(u32::MAX) + 1 {
            return Err(TransportError::SequenceExhausted);
        }

        // Bounded by the check above.
        let first = self.send_sequence as u32;
        let packets = fragment::split(self.id, first, message, self.max_payload)?;
        self.send_sequence = end;

        for packet in &packets {
            self.reliability.track(packet.clone(), now);
        }
        self.outbound.insert(first, packets.len());

        Ok(OutboundMessage {
            message_id: first,
            packets,
        })
    }

    /// Process an inbound DATA packet.
    ///
    /// A sequence is recorded as received only once its payload is stored,
    /// so a refused packet is neither acknowledged nor treated as a
    /// duplicate when the peer retransmits it.
    pub fn on_data(&mut self, packet: Packet, now: Instant) -> DataOutcome {
        self.last_activity = now;
        let sequence = packet.sequence();

        if self.was_received(sequence) {
            return DataOutcome::Duplicate {
                ack: Packet::ack(self.id, sequence),
            };
        }
        if let Some(reason) = self.refusal(&packet) {
            return DataOutcome::Refused { reason };
        }

        let fragments = packet.fragment().count;
        let head = u64::from(packet.message_id()) == self.next_deliver;
        let delivered = match self.reassembly.insert(packet, head) {
            Insert::Rejected(reason) => return DataOutcome::Refused { reason },
            Insert::Pending => 0,
            Insert::Complete(message_id, bytes) => {
                self.held += bytes.len();
                self.ready.insert(u64::from(message_id), (fragments, bytes));
                self.flush_ready()
            }
        };
        self.mark_received(sequence);

        DataOutcome::Accepted {
            ack: Packet::ack(self.id, sequence),
            delivered,
        }
    }

    /// Process an inbound ACK.
    ///
    /// Returns the message id once its last fragment is acknowledged.
    pub fn on_ack(&mut self, sequence: u32, now: Instant) -> Option<u32> {
        self.last_activity = now;
        let acked = self.reliability.acknowledge(sequence)?;
        let message_id = acked.packet.message_id();

        let remaining = self.outbound.get_mut(&message_id)?;
        *remaining -= 1;
        if *remaining > 0 {
            return None;
        }
        self.outbound.remove(&message_id);
        Some(message_id)
    }

    /// Note inbound traffic that carries no data.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Run the retransmission scan.
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        self.reliability.poll(now)
    }

    /// Check if nothing has arrived for `idle_timeout`.
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= idle_timeout
    }

    /// Next delivered message, if any.
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        let message = self.inbox.pop_front()?;
        self.held -= message.len();
        Some(message)
    }

    /// Remove every delivered message not yet received.
    pub fn take_inbox(&mut self) -> VecDeque<Vec<u8>> {
        let inbox = std::mem::take(&mut self.inbox);
        self.held -= inbox.iter().map(Vec::len).sum::<usize>();
        inbox
    }

    /// Messages waiting for `receive`.
    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    /// DATA packets awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.reliability.in_flight()
    }

    /// Outbound messages not yet fully acknowledged.
    pub fn pending_messages(&self) -> impl Iterator<Item = u32> + '_ {
        self.outbound.keys().copied()
    }

    /// Next sequence number this side will send.
    pub fn send_sequence(&self) -> u64 {
        self.send_sequence
    }

    /// Lowest inbound sequence not yet received.
    pub fn recv_sequence(&self) -> u64 {
        self.recv_sequence
    }

    /// Transition to closing.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    /// Mark as fully closed and discard all buffered state.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.reliability.clear();
        self.outbound.clear();
        self.reassembly.clear();
        self.ready.clear();
        self.inbox.clear();
        self.received_above.clear();
        self.held = 0;
    }

    /// Check if an inbound sequence was already stored.
    fn was_received(&self, sequence: u32) -> bool {
        let sequence = u64::from(sequence);
        sequence < self.recv_sequence || self.received_above.contains(&sequence)
    }

    /// Why a new DATA packet cannot be stored, if it cannot.
    fn refusal(&self, packet: &Packet) -> Option<&'static str> {
        let sequence = u64::from(packet.sequence());
        if sequence >= self.recv_sequence + self.receive_window {
            return Some("beyond receive window");
        }
        match sequence.checked_sub(u64::from(packet.fragment().index)) {
            Some(message_id) if message_id >= self.next_deliver => {}
            _ => return Some("fragment of an already delivered message"),
        }
        let buffered = self.held + self.reassembly.buffered_bytes();
        if buffered + packet.payload().len() > self.max_buffered {
            return Some("receive buffer full");
        }
        None
    }

    /// Record a stored inbound sequence.
    fn mark_received(&mut self, sequence: u32) {
        self.received_above.insert(u64::from(sequence));
        while self.received_above.remove(&self.recv_sequence) {
            self.recv_sequence += 1;
        }
    }

    /// Move completed messages to the inbox in message-id order.
    fn flush_ready(&mut self) -> usize {
        let mut delivered = 0;
        while let Some((fragments, bytes)) = self.ready.remove(&self.next_deliver) {
            self.inbox.push_back(bytes);
            self.next_deliver += u64::from(fragments);
            delivered += 1;
        }
        delivered
    }
}
