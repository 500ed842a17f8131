//! Fragmentation and reassembly.
//!
//! A message larger than the configured payload size is cut into
//! fragments that occupy consecutive sequence numbers. The first
//! fragment's sequence doubles as the message id, so a receiver recovers
//! it from any fragment as `sequence - fragment_index`.

use std::collections::{BTreeMap, HashMap, btree_map};

use tracing::debug;

use super::error::{TransportError, TransportResult};
use super::packet::{FragmentInfo, Packet, SessionId};

/// True when `len` bytes do not fit in one packet.
///
/// Pure size classification; no I/O is involved.
pub fn needs_fragmentation(len: usize, max_payload: usize) -> bool {
    len > max_payload
}

/// Number of packets a message of `len` bytes occupies.
///
/// An empty message still takes one (empty) packet.
pub fn fragment_count(len: usize, max_payload: usize) -> usize {
    if len == 0 { 1 } else { len.div_ceil(max_payload) }
}

/// Split `message` into DATA packets numbered from `first_sequence`.
///
/// The caller reserves `fragment_count(message.len(), max_payload)`
/// sequence numbers starting at `first_sequence`.
pub fn split(
    session_id: SessionId,
    first_sequence: u32,
    message: &[u8],
    max_payload: usize,
) -> TransportResult<Vec<Packet>> {
    let count = fragment_count(message.len(), max_payload);
    let count = u16::try_from(count).map_err(|_| TransportError::MessageTooLarge {
        size: message.len(),
        max: usize::from(u16::MAX).saturating_mul(max_payload),
    })?;

    if count == 1 {
        let packet = Packet::data(
            session_id,
            first_sequence,
            FragmentInfo::WHOLE,
            message.to_vec(),
        )?;
        return Ok(vec![packet]);
    }

    message
        .chunks(max_payload)
        .zip(0u16..)
        .map(|(chunk, index)| {
            let sequence = first_sequence.wrapping_add(u32::from(index));
            let fragment = FragmentInfo { index, count };
            Ok(Packet::data(session_id, sequence, fragment, chunk.to_vec())?)
        })
        .collect()
}

/// Fragments of one message received so far.
#[derive(Debug)]
struct PartialMessage {
    count: u16,
    parts: BTreeMap<u16, Vec<u8>>,
    bytes: usize,
}

impl PartialMessage {
    fn new(count: u16) -> Self {
        Self {
            count,
            parts: BTreeMap::new(),
            bytes: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == usize::from(self.count)
    }

    fn concat(self) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.bytes);
        for part in self.parts.into_values() {
            message.extend_from_slice(&part);
        }
        message
    }
}

/// Result of offering one DATA packet to a [`Reassembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum Insert {
    /// Stored; the message still has fragments outstanding.
    Pending,
    /// Last fragment arrived: `(message_id, bytes)`.
    Complete(u32, Vec<u8>),
    /// Not stored. The packet must not be acknowledged.
    Rejected(&'static str),
}

/// Reassembly buffer keyed by message id.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<u32, PartialMessage>,
    max_partial: usize,
    buffered: usize,
}

impl Reassembler {
    /// Create an empty buffer holding at most `max_partial` messages.
    pub fn new(max_partial: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_partial,
            buffered: 0,
        }
    }

    /// Accept one DATA packet.
    ///
    /// Fragments may arrive in any order; whole packets complete
    /// immediately. A fragment that disagrees with its message's known
    /// fragment count is rejected, as is the first fragment of a new
    /// message once `max_partial` messages are pending. `head` marks the
    /// message the receiver is blocked on, which is always admitted.
    pub fn insert(&mut self, packet: Packet, head: bool) -> Insert {
        let message_id = packet.message_id();
        let FragmentInfo { index, count } = packet.fragment();

        if count == 1 {
            return Insert::Complete(message_id, packet.into_payload());
        }

        if !head
            && self.partial.len() >= self.max_partial
            && !self.partial.contains_key(&message_id)
        {
            debug!(message_id, pending = self.partial.len(), "too many partial messages");
            return Insert::Rejected("too many partial messages");
        }

        let partial = self
            .partial
            .entry(message_id)
            .or_insert_with(|| PartialMessage::new(count));

        if partial.count != count {
            debug!(message_id, index, count, expected = partial.count, "fragment count disagrees");
            return Insert::Rejected("fragment count disagrees with message");
        }

        if let btree_map::Entry::Vacant(slot) = partial.parts.entry(index) {
            let payload = packet.into_payload();
            partial.bytes += payload.len();
            self.buffered += payload.len();
            slot.insert(payload);
        }

        if !partial.is_complete() {
            return Insert::Pending;
        }

        match self.partial.remove(&message_id) {
            Some(message) => {
                self.buffered -= message.bytes;
                Insert::Complete(message_id, message.concat())
            }
            None => Insert::Pending,
        }
    }

    /// Messages with at least one fragment outstanding.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Payload bytes held across every partial message.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Discard every partial message.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.buffered = 0;
    }
}
