//! Handshake state machines.
//!
//! The client repeats one logical `HANDSHAKE_REQUEST` (same nonce) until a
//! matching response arrives or its attempt budget runs out. The server
//! answers with a freshly allocated id and keeps re-sending the response
//! until the client confirms it. Both sides are driven by the endpoint
//! tick through explicit deadlines.
//!
//! ```text
//! Client                              Server
//!   | HANDSHAKE_REQUEST (sid 0, nonce)   |
//!   |----------------------------------->|  allocate id
//!   | HANDSHAKE_RESPONSE (sid id, nonce) |
//!   |<-----------------------------------|  HANDSHAKING
//!   | ACK (sid id, nonce)                |
//!   |----------------------------------->|  ESTABLISHED
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use super::packet::{Packet, PacketBody, PacketType, SessionId};

/// Random nonzero handshake nonce.
pub fn generate_nonce<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(1..=u32::MAX)
}

/// Random nonzero session id for which `in_use` is false.
pub fn allocate_session_id<R, F>(rng: &mut R, in_use: F) -> SessionId
where
    R: Rng + ?Sized,
    F: Fn(SessionId) -> bool,
{
    loop {
        let id = SessionId::new(rng.gen_range(1..=u32::MAX));
        if !in_use(id) {
            return id;
        }
    }
}

/// What a tick means for a pending client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePoll {
    /// Nothing to do yet.
    Waiting,
    /// Send this request again.
    Retransmit(Packet),
    /// The last attempt expired.
    TimedOut {
        /// Requests sent in total.
        attempts: u32,
    },
}

/// What an inbound packet means for a pending client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Matching response: the session exists with this id.
    Established(SessionId),
    /// The server refused the session.
    Rejected(String),
    /// Protocol violation; abort the connect.
    Unexpected(PacketType),
    /// Not for this handshake.
    Ignored,
}

/// Client side of one connect attempt.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    peer: SocketAddr,
    nonce: u32,
    attempts: u32,
    max_attempts: u32,
    timeout: Duration,
    deadline: Instant,
}

impl ClientHandshake {
    /// Start a handshake, returning the first request to send.
    pub fn start(
        peer: SocketAddr,
        nonce: u32,
        max_attempts: u32,
        timeout: Duration,
        now: Instant,
    ) -> (Self, Packet) {
        let handshake = Self {
            peer,
            nonce,
            attempts: 1,
            max_attempts,
            timeout,
            deadline: now + timeout,
        };
        (handshake, Packet::handshake_request(nonce))
    }

    /// Target address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Nonce carried by every request of this attempt.
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Requests sent so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Advance the retry timer.
    pub fn poll(&mut self, now: Instant) -> HandshakePoll {
        if now < self.deadline {
            return HandshakePoll::Waiting;
        }
        if self.attempts >= self.max_attempts {
            return HandshakePoll::TimedOut {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        self.deadline = now + self.timeout;
        HandshakePoll::Retransmit(Packet::handshake_request(self.nonce))
    }

    /// Classify a packet received from the target peer.
    pub fn on_packet(&self, packet: &Packet) -> HandshakeEvent {
        match packet.body() {
            PacketBody::HandshakeResponse { session_id, nonce } if nonce == self.nonce => {
                if session_id.is_unassigned() {
                    HandshakeEvent::Unexpected(PacketType::HandshakeResponse)
                } else {
                    HandshakeEvent::Established(session_id)
                }
            }
            // Response to an earlier connect
            PacketBody::HandshakeResponse { .. } => HandshakeEvent::Ignored,
            PacketBody::Error { sequence, reason } if packet.session_id().is_unassigned() => {
                if sequence == self.nonce {
                    HandshakeEvent::Rejected(reason.into_owned())
                } else {
                    HandshakeEvent::Ignored
                }
            }
            _ if packet.session_id().is_unassigned() => {
                HandshakeEvent::Unexpected(packet.packet_type())
            }
            _ => HandshakeEvent::Ignored,
        }
    }
}

/// Server side of a handshake, alive until the client confirms.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    response: Packet,
    sent: u32,
    max_attempts: u32,
    timeout: Duration,
    deadline: Instant,
}

impl ServerHandshake {
    /// Answer a request, returning the response to send.
    pub fn start(
        session_id: SessionId,
        nonce: u32,
        max_attempts: u32,
        timeout: Duration,
        now: Instant,
    ) -> (Self, Packet) {
        let response = Packet::handshake_response(session_id, nonce);
        let handshake = Self {
            response: response.clone(),
            sent: 1,
            max_attempts,
            timeout,
            deadline: now + timeout,
        };
        (handshake, response)
    }

    /// The response, for answering a repeated request.
    pub fn response(&self) -> &Packet {
        &self.response
    }

    /// Nonce this handshake answers.
    pub fn nonce(&self) -> u32 {
        self.response.sequence()
    }

    /// Check if `packet` confirms the handshake.
    pub fn is_confirmation(&self, packet: &Packet) -> bool {
        packet.packet_type() == PacketType::Ack
            && packet.session_id() == self.response.session_id()
            && packet.sequence() == self.nonce()
    }

    /// Re-send the response while the client has not confirmed.
    ///
    /// Stops after `max_attempts` responses; the idle timeout reaps the
    /// half-open session.
    pub fn poll(&mut self, now: Instant) -> Option<Packet> {
        if now < self.deadline || self.sent >= self.max_attempts {
            return None;
        }
        self.sent += 1;
        self.deadline = now + self.timeout;
        Some(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::packet::FragmentInfo;

    const RTO: Duration = Duration::from_millis(200);

    fn peer() -> SocketAddr {
        "127.0.0.1:7357".parse().unwrap()
    }

    #[test]
    fn test_nonce_and_id_are_nonzero() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            assert_ne!(generate_nonce(&mut rng), 0);
        }

        let taken = SessionId::new(5);
        let id = allocate_session_id(&mut rng, |id| id == taken);
        assert!(!id.is_unassigned());
        assert_ne!(id, taken);
    }

    #[test]
    fn test_client_attempt_budget() {
        let start = Instant::now();
        let (mut handshake, first) = ClientHandshake::start(peer(), 77, 3, RTO, start);
        assert_eq!(first, Packet::handshake_request(77));
        assert_eq!(handshake.attempts(), 1);

        assert_eq!(handshake.poll(start + RTO / 2), HandshakePoll::Waiting);
        assert_eq!(
            handshake.poll(start + RTO),
            HandshakePoll::Retransmit(Packet::handshake_request(77))
        );
        assert_eq!(
            handshake.poll(start + RTO * 2),
            HandshakePoll::Retransmit(Packet::handshake_request(77))
        );
        assert_eq!(handshake.attempts(), 3);
        assert_eq!(
            handshake.poll(start + RTO * 3),
            HandshakePoll::TimedOut { attempts: 3 }
        );
    }

    #[test]
    fn test_client_single_attempt() {
        let start = Instant::now();
        let (mut handshake, _) = ClientHandshake::start(peer(), 1, 1, RTO, start);
        assert_eq!(
            handshake.poll(start + RTO),
            HandshakePoll::TimedOut { attempts: 1 }
        );
    }

    #[test]
    fn test_client_accepts_matching_response() {
        let (handshake, _) = ClientHandshake::start(peer(), 77, 3, RTO, Instant::now());
        let id = SessionId::new(0xabcd);

        assert_eq!(
            handshake.on_packet(&Packet::handshake_response(id, 77)),
            HandshakeEvent::Established(id)
        );
        assert_eq!(
            handshake.on_packet(&Packet::handshake_response(id, 78)),
            HandshakeEvent::Ignored
        );
        assert_eq!(
            handshake.on_packet(&Packet::handshake_response(SessionId::UNASSIGNED, 77)),
            HandshakeEvent::Unexpected(PacketType::HandshakeResponse)
        );
    }

    #[test]
    fn test_client_rejected() {
        let (handshake, _) = ClientHandshake::start(peer(), 77, 3, RTO, Instant::now());
        assert_eq!(
            handshake.on_packet(&Packet::error(SessionId::UNASSIGNED, 77, "server at capacity")),
            HandshakeEvent::Rejected("server at capacity".into())
        );
        assert_eq!(
            handshake.on_packet(&Packet::error(SessionId::UNASSIGNED, 1, "other")),
            HandshakeEvent::Ignored
        );
    }

    #[test]
    fn test_client_unexpected_types() {
        let (handshake, _) = ClientHandshake::start(peer(), 77, 3, RTO, Instant::now());

        assert_eq!(
            handshake.on_packet(&Packet::handshake_request(77)),
            HandshakeEvent::Unexpected(PacketType::HandshakeRequest)
        );
        let data = Packet::data(SessionId::UNASSIGNED, 1, FragmentInfo::WHOLE, vec![1]).unwrap();
        assert_eq!(
            handshake.on_packet(&data),
            HandshakeEvent::Unexpected(PacketType::Data)
        );
        assert_eq!(
            handshake.on_packet(&Packet::ack(SessionId::UNASSIGNED, 77)),
            HandshakeEvent::Unexpected(PacketType::Ack)
        );

        // Traffic for established sessions is not the handshake's business
        assert_eq!(
            handshake.on_packet(&Packet::ack(SessionId::new(3), 1)),
            HandshakeEvent::Ignored
        );
    }

    #[test]
    fn test_server_resends_until_budget() {
        let start = Instant::now();
        let id = SessionId::new(9);
        let (mut handshake, response) = ServerHandshake::start(id, 77, 2, RTO, start);
        assert_eq!(response, Packet::handshake_response(id, 77));
        assert_eq!(handshake.response(), &response);
        assert_eq!(handshake.nonce(), 77);

        assert_eq!(handshake.poll(start + RTO / 2), None);
        assert_eq!(handshake.poll(start + RTO), Some(response));
        assert_eq!(handshake.poll(start + RTO * 5), None);
    }

    #[test]
    fn test_server_confirmation() {
        let id = SessionId::new(9);
        let (handshake, _) = ServerHandshake::start(id, 77, 3, RTO, Instant::now());

        assert!(handshake.is_confirmation(&Packet::ack(id, 77)));
        assert!(!handshake.is_confirmation(&Packet::ack(id, 1)));
        assert!(!handshake.is_confirmation(&Packet::ack(SessionId::new(10), 77)));
        assert!(!handshake.is_confirmation(&Packet::error(id, 77, "closing")));
    }
}
