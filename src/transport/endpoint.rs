//! Shared endpoint core.
//!
//! One [`Endpoint`] owns one socket and the session table. A background
//! driver task is the only reader of the socket: it decodes datagrams,
//! routes them to sessions or pending handshakes, and runs the periodic
//! tick that retransmits, expires handshakes and reaps idle sessions.
//! Foreground `send`/`receive`/`close` calls take the table lock briefly
//! and wait on oneshot channels or a per-session [`Notify`].
//!
//! Datagrams produced while the lock is held are collected and written
//! after it is released.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::codec;
use super::error::{TransportError, TransportResult};
use super::handshake::{self, ClientHandshake, HandshakeEvent, HandshakePoll, ServerHandshake};
use super::packet::{Packet, PacketBody, PacketType, SessionId};
use super::reliability::DeliveryFailure;
use super::session::{DataOutcome, Session, SessionState};
use super::socket::CofSocket;
use crate::core::{CofError, MAX_DATAGRAM_SIZE, TransportConfig};

/// Reason carried by the ERROR packet sent on an explicit close.
pub const CLOSE_REASON: &str = "session closed";

/// Reason sent to a client when the session table is full.
pub const CAPACITY_REASON: &str = "server at capacity";

/// Reason sent when a DATA packet exhausts its retransmissions.
pub const MAX_RETRIES_REASON: &str = "max retries exceeded";

/// Reason sent when a session sees no inbound traffic for too long.
pub const IDLE_REASON: &str = "idle timeout";

/// Wake-up and closed flag shared between a session and its handles.
///
/// Once closed it also holds the messages the session had delivered but
/// nobody had received yet.
#[derive(Debug, Default)]
struct SessionSignal {
    notify: Notify,
    closed: AtomicBool,
    unread: std::sync::Mutex<VecDeque<Vec<u8>>>,
}

impl SessionSignal {
    fn close(&self, unread: VecDeque<Vec<u8>>) {
        *self.unread() = unread;
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn take_unread(&self) -> Option<Vec<u8>> {
        self.unread().pop_front()
    }

    fn unread(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.unread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a session is torn down.
#[derive(Debug, Clone, Copy)]
enum Teardown {
    /// `close`, shutdown or an abandoned connect; unread messages are dropped.
    Local,
    /// The peer sent ERROR.
    Peer,
    /// No inbound traffic for `idle_timeout`.
    Idle,
    /// A DATA packet ran out of retransmissions.
    Failed(DeliveryFailure),
}

impl Teardown {
    /// ERROR reason sent to the peer, if any.
    fn notice(self) -> Option<&'static str> {
        match self {
            Self::Local => Some(CLOSE_REASON),
            Self::Peer => None,
            Self::Idle => Some(IDLE_REASON),
            Self::Failed(_) => Some(MAX_RETRIES_REASON),
        }
    }

    /// Whether messages already delivered stay readable after the close.
    fn keeps_unread(self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Handle to an established session.
///
/// Returned by `connect` and by a server's `Incoming`; passed back to
/// `send`, `receive` and `close` on the endpoint that issued it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    signal: Arc<SessionSignal>,
}

impl SessionHandle {
    /// Session id agreed during the handshake.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Handle not issued by any endpoint.
    #[cfg(test)]
    pub(crate) fn detached(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            signal: Arc::default(),
        }
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.peer == other.peer
    }
}

impl Eq for SessionHandle {}

/// Endpoint counters.
///
/// Dropped datagrams are reported here rather than as errors.
#[derive(Debug, Default)]
pub struct EndpointStats {
    datagrams_received: AtomicU64,
    decode_failures: AtomicU64,
    unknown_session_drops: AtomicU64,
    retransmissions: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

/// Point-in-time copy of [`EndpointStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Datagrams read from the socket.
    pub datagrams_received: u64,
    /// Datagrams rejected by the codec.
    pub decode_failures: u64,
    /// Packets for unknown sessions or from the wrong address.
    pub unknown_session_drops: u64,
    /// DATA retransmissions.
    pub retransmissions: u64,
    /// Sessions created.
    pub sessions_opened: u64,
    /// Sessions closed for any reason.
    pub sessions_closed: u64,
}

impl EndpointStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unknown_session_drops: self.unknown_session_drops.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
        }
    }
}

/// Which side of the handshake this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

struct SessionEntry {
    session: Session,
    signal: Arc<SessionSignal>,
    /// `send` calls waiting for their message to be fully acknowledged.
    waiters: HashMap<u32, oneshot::Sender<TransportResult<()>>>,
    /// Server side, until the client confirms.
    handshake: Option<ServerHandshake>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session,
            signal: Arc::new(SessionSignal::default()),
            waiters: HashMap::new(),
            handshake: None,
        }
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.session.id,
            peer: self.session.peer,
            signal: Arc::clone(&self.signal),
        }
    }
}

struct PendingConnect {
    handshake: ClientHandshake,
    reply: oneshot::Sender<TransportResult<SessionHandle>>,
}

#[derive(Default)]
struct EndpointState {
    sessions: HashMap<SessionId, SessionEntry>,
    /// Client: connects in flight, keyed by nonce.
    connecting: HashMap<u32, PendingConnect>,
    /// Server: session created for each `(peer, nonce)` request.
    half_open: HashMap<(SocketAddr, u32), SessionId>,
    /// Server: where established sessions are announced.
    accepted: Option<mpsc::UnboundedSender<SessionHandle>>,
}

type Outgoing = Vec<(Packet, SocketAddr)>;

/// Socket, session table and counters of one client or server.
pub struct Endpoint {
    socket: CofSocket,
    config: TransportConfig,
    role: Role,
    local_addr: SocketAddr,
    state: Mutex<EndpointState>,
    stats: EndpointStats,
}

/// A running endpoint; dropping it stops the driver task.
pub(crate) struct EndpointHandle {
    endpoint: Arc<Endpoint>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl EndpointHandle {
    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop the driver and wait for it to close every session.
    pub(crate) async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

enum DriverEvent {
    Datagram(io::Result<(usize, SocketAddr)>),
    Tick,
    Shutdown,
}

impl Endpoint {
    /// Bind a client endpoint and start its driver.
    pub(crate) async fn client(
        addr: SocketAddr,
        config: TransportConfig,
    ) -> TransportResult<EndpointHandle> {
        Self::start(addr, config, Role::Client, None).await
    }

    /// Bind a server endpoint and start its driver.
    pub(crate) async fn server(
        addr: SocketAddr,
        config: TransportConfig,
        accepted: mpsc::UnboundedSender<SessionHandle>,
    ) -> TransportResult<EndpointHandle> {
        Self::start(addr, config, Role::Server, Some(accepted)).await
    }

    async fn start(
        addr: SocketAddr,
        config: TransportConfig,
        role: Role,
        accepted: Option<mpsc::UnboundedSender<SessionHandle>>,
    ) -> TransportResult<EndpointHandle> {
        config.validate().map_err(|err| match err {
            CofError::Config(reason) => TransportError::InvalidConfig(reason),
            other => TransportError::InvalidConfig(other.to_string()),
        })?;
        let socket = CofSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        let endpoint = Arc::new(Self {
            socket,
            config,
            role,
            local_addr,
            state: Mutex::new(EndpointState {
                accepted,
                ..EndpointState::default()
            }),
            stats: EndpointStats::default(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = tokio::spawn(Arc::clone(&endpoint).run(shutdown_rx));
        info!(%local_addr, role = ?role, "endpoint started");

        Ok(EndpointHandle {
            endpoint,
            shutdown: Some(shutdown_tx),
            driver: Some(driver),
        })
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of sessions in the table, half-open ones included.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Run a client handshake against `peer`.
    pub async fn connect(&self, peer: SocketAddr) -> TransportResult<SessionHandle> {
        let (reply, request) = {
            let mut state = self.state.lock().await;
            let nonce = loop {
                let nonce = handshake::generate_nonce(&mut rand::thread_rng());
                if !state.connecting.contains_key(&nonce) {
                    break nonce;
                }
            };
            let (handshake, request) = ClientHandshake::start(
                peer,
                nonce,
                self.config.handshake_attempts,
                self.config.retransmit_timeout(),
                Instant::now(),
            );
            let (tx, rx) = oneshot::channel();
            state.connecting.insert(
                nonce,
                PendingConnect {
                    handshake,
                    reply: tx,
                },
            );
            (rx, request)
        };

        debug!(%peer, nonce = request.sequence(), "sending handshake request");
        self.transmit(vec![(request, peer)]).await;
        reply.await.unwrap_or(Err(TransportError::SessionClosed))
    }

    /// Send one message and wait until every fragment is acknowledged.
    pub async fn send(&self, handle: &SessionHandle, message: &[u8]) -> TransportResult<()> {
        let (done, packets) = {
            let mut state = self.state.lock().await;
            let entry = lookup(&mut state, handle)?;
            let outbound = entry.session.prepare_send(message, Instant::now())?;
            let (tx, rx) = oneshot::channel();
            entry.waiters.insert(outbound.message_id, tx);
            (rx, outbound.packets)
        };

        debug!(
            session = %handle.id,
            bytes = message.len(),
            fragments = packets.len(),
            "sending message"
        );
        // Lost writes are recovered by retransmission.
        self.transmit(packets.into_iter().map(|p| (p, handle.peer)).collect())
            .await;
        done.await.unwrap_or(Err(TransportError::SessionClosed))
    }

    /// Wait for the next complete message, bounded by `receive_timeout`.
    ///
    /// After the peer closes the session, or it closes on its own, messages
    /// that had already arrived are still returned before `SessionClosed`.
    pub async fn receive(&self, handle: &SessionHandle) -> TransportResult<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + self.config.receive_timeout();
        loop {
            {
                let mut state = self.state.lock().await;
                let entry = match lookup(&mut state, handle) {
                    Ok(entry) => entry,
                    Err(TransportError::SessionClosed) => {
                        return handle.signal.take_unread().ok_or(TransportError::SessionClosed);
                    }
                    Err(err) => return Err(err),
                };
                if let Some(message) = entry.session.pop_message() {
                    return Ok(message);
                }
            }
            tokio::time::timeout_at(deadline, handle.signal.notify.notified())
                .await
                .map_err(|_| TransportError::Timeout)?;
        }
    }

    /// Close a session, failing its pending operations.
    ///
    /// Closing an already-closed session is a no-op.
    pub async fn close(&self, handle: &SessionHandle) -> TransportResult<()> {
        let outgoing = {
            let mut state = self.state.lock().await;
            match lookup(&mut state, handle) {
                Ok(_) => {}
                Err(TransportError::SessionClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
            let mut outgoing = Outgoing::new();
            self.finish(&mut state, handle.id, Teardown::Local, &mut outgoing);
            outgoing
        };
        self.transmit(outgoing).await;
        Ok(())
    }

    /// Current state of a session; `Closed` once it has left the table.
    pub async fn session_state(&self, handle: &SessionHandle) -> SessionState {
        let mut state = self.state.lock().await;
        lookup(&mut state, handle)
            .map(|entry| entry.session.state)
            .unwrap_or(SessionState::Closed)
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut tick = tokio::time::interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => DriverEvent::Shutdown,
                received = self.socket.recv_from(&mut buf) => DriverEvent::Datagram(received),
                _ = tick.tick() => DriverEvent::Tick,
            };

            match event {
                DriverEvent::Datagram(Ok((len, from))) => {
                    self.handle_datagram(&buf[..len], from).await;
                }
                DriverEvent::Datagram(Err(err)) => {
                    warn!(error = %err, "socket receive failed");
                }
                DriverEvent::Tick => self.on_tick(Instant::now()).await,
                DriverEvent::Shutdown => break,
            }
        }

        self.close_all().await;
        info!(local_addr = %self.local_addr, "endpoint stopped");
    }

    async fn transmit(&self, outgoing: Outgoing) {
        for (packet, addr) in outgoing {
            if let Err(err) = self.socket.send_packet(&packet, addr).await {
                warn!(%addr, error = %err, "failed to send datagram");
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        EndpointStats::bump(&self.stats.datagrams_received);

        let packet = match codec::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                EndpointStats::bump(&self.stats.decode_failures);
                debug!(%from, len = data.len(), error = %err, "dropping undecodable datagram");
                return;
            }
        };

        let outgoing = {
            let mut state = self.state.lock().await;
            let mut outgoing = Outgoing::new();
            self.dispatch(&mut state, packet, from, Instant::now(), &mut outgoing);
            outgoing
        };
        self.transmit(outgoing).await;
    }

    async fn on_tick(&self, now: Instant) {
        let outgoing = {
            let mut state = self.state.lock().await;
            let mut outgoing = Outgoing::new();
            self.poll_sessions(&mut state, now, &mut outgoing);
            self.poll_handshakes(&mut state, now, &mut outgoing);
            outgoing
        };
        self.transmit(outgoing).await;
    }

    async fn close_all(&self) {
        let outgoing = {
            let mut state = self.state.lock().await;
            let mut outgoing = Outgoing::new();
            let ids: Vec<SessionId> = state.sessions.keys().copied().collect();
            for id in ids {
                self.finish(&mut state, id, Teardown::Local, &mut outgoing);
            }
            for (_, pending) in state.connecting.drain() {
                let _ = pending.reply.send(Err(TransportError::SessionClosed));
            }
            state.half_open.clear();
            // Ends the listener's `Incoming` stream
            state.accepted = None;
            outgoing
        };
        self.transmit(outgoing).await;
    }

    fn dispatch(
        &self,
        state: &mut EndpointState,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
        out: &mut Outgoing,
    ) {
        let packet_type = packet.packet_type();
        let handshake_traffic =
            packet.session_id().is_unassigned() || packet_type.is_handshake();

        match (self.role, handshake_traffic) {
            (Role::Server, true) => match packet.body() {
                PacketBody::HandshakeRequest { nonce } if packet.session_id().is_unassigned() => {
                    self.on_handshake_request(state, nonce, from, now, out);
                }
                _ => {
                    EndpointStats::bump(&self.stats.unknown_session_drops);
                    debug!(%from, %packet_type, "dropping unexpected handshake traffic");
                }
            },
            (Role::Client, true) => self.on_handshake_packet(state, &packet, from, now, out),
            (_, false) => self.on_session_packet(state, packet, from, now, out),
        }
    }

    fn on_handshake_request(
        &self,
        state: &mut EndpointState,
        nonce: u32,
        from: SocketAddr,
        now: Instant,
        out: &mut Outgoing,
    ) {
        if let Some(id) = state.half_open.get(&(from, nonce)).copied() {
            match state.sessions.get(&id).and_then(|entry| entry.handshake.as_ref()) {
                Some(pending) => {
                    debug!(session = %id, %from, nonce, "repeated handshake request");
                    out.push((pending.response().clone(), from));
                }
                None => debug!(session = %id, %from, nonce, "late handshake request ignored"),
            }
            return;
        }

        if state.sessions.len() >= self.config.max_sessions {
            warn!(
                %from,
                max = self.config.max_sessions,
                "rejecting handshake: session table full"
            );
            out.push((Packet::error(SessionId::UNASSIGNED, nonce, CAPACITY_REASON), from));
            return;
        }

        let sessions = &state.sessions;
        let id = handshake::allocate_session_id(&mut rand::thread_rng(), |id| {
            sessions.contains_key(&id)
        });

        let mut session = Session::new(id, from, &self.config, now);
        session.begin_handshake(nonce);
        let (pending, response) = ServerHandshake::start(
            id,
            nonce,
            self.config.handshake_attempts,
            self.config.retransmit_timeout(),
            now,
        );

        let mut entry = SessionEntry::new(session);
        entry.handshake = Some(pending);
        state.sessions.insert(id, entry);
        state.half_open.insert((from, nonce), id);
        EndpointStats::bump(&self.stats.sessions_opened);

        info!(session = %id, peer = %from, "session allocated");
        out.push((response, from));
    }

    fn on_handshake_packet(
        &self,
        state: &mut EndpointState,
        packet: &Packet,
        from: SocketAddr,
        now: Instant,
        out: &mut Outgoing,
    ) {
        let events: Vec<(u32, HandshakeEvent)> = state
            .connecting
            .iter()
            .filter(|(_, pending)| pending.handshake.peer() == from)
            .map(|(nonce, pending)| (*nonce, pending.handshake.on_packet(packet)))
            .filter(|(_, event)| *event != HandshakeEvent::Ignored)
            .collect();

        if events.is_empty() {
            self.on_stray_handshake_packet(state, packet, from, out);
            return;
        }

        for (nonce, event) in events {
            let Some(pending) = state.connecting.remove(&nonce) else {
                continue;
            };
            let result = match event {
                HandshakeEvent::Established(id) => {
                    self.establish_client_session(state, id, nonce, from, now, out)
                }
                HandshakeEvent::Rejected(reason) => {
                    warn!(peer = %from, %reason, "handshake rejected");
                    Err(TransportError::Rejected(reason))
                }
                HandshakeEvent::Unexpected(packet_type) => {
                    warn!(peer = %from, %packet_type, "protocol violation during handshake");
                    Err(TransportError::UnexpectedPacketType(packet_type))
                }
                HandshakeEvent::Ignored => continue,
            };

            if let Err(Ok(handle)) = pending.reply.send(result) {
                // The connect call went away; do not leave the session behind.
                self.finish(state, handle.id, Teardown::Local, out);
            }
        }
    }

    fn establish_client_session(
        &self,
        state: &mut EndpointState,
        id: SessionId,
        nonce: u32,
        from: SocketAddr,
        now: Instant,
        out: &mut Outgoing,
    ) -> TransportResult<SessionHandle> {
        if state.sessions.contains_key(&id) {
            warn!(session = %id, peer = %from, "server assigned a session id already in use");
            return Err(TransportError::Rejected(format!("session id {id} already in use")));
        }

        let mut session = Session::new(id, from, &self.config, now);
        session.begin_handshake(nonce);
        session.establish();

        let entry = SessionEntry::new(session);
        let handle = entry.handle();
        state.sessions.insert(id, entry);
        EndpointStats::bump(&self.stats.sessions_opened);

        info!(session = %id, peer = %from, "session established");
        out.push((Packet::ack(id, nonce), from));
        Ok(handle)
    }

    /// Session-0 or handshake traffic that matches no pending connect.
    fn on_stray_handshake_packet(
        &self,
        state: &mut EndpointState,
        packet: &Packet,
        from: SocketAddr,
        out: &mut Outgoing,
    ) {
        // The server re-sends its response until our confirming ACK lands.
        if let PacketBody::HandshakeResponse { session_id, nonce } = packet.body() {
            if let Some(entry) = state.sessions.get(&session_id) {
                if entry.session.peer == from && entry.session.handshake_nonce == Some(nonce) {
                    debug!(session = %session_id, "re-confirming handshake");
                    out.push((Packet::ack(session_id, nonce), from));
                    return;
                }
            }
        }
        EndpointStats::bump(&self.stats.unknown_session_drops);
        debug!(
            %from,
            packet_type = %packet.packet_type(),
            "dropping handshake traffic with no pending connect"
        );
    }

    fn on_session_packet(
        &self,
        state: &mut EndpointState,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
        out: &mut Outgoing,
    ) {
        let id = packet.session_id();
        let packet_type = packet.packet_type();

        let Some(entry) = state.sessions.get_mut(&id) else {
            EndpointStats::bump(&self.stats.unknown_session_drops);
            debug!(session = %id, %from, %packet_type, "dropping packet for unknown session");
            return;
        };
        if entry.session.peer != from {
            EndpointStats::bump(&self.stats.unknown_session_drops);
            debug!(session = %id, %from, "dropping packet from foreign address");
            return;
        }

        if packet_type == PacketType::Error {
            let reason = String::from_utf8_lossy(packet.payload()).into_owned();
            warn!(session = %id, peer = %from, %reason, "peer closed session");
            self.finish(state, id, Teardown::Peer, out);
            return;
        }

        // Server: the confirming ACK or any DATA completes the handshake.
        if let Some(pending) = &entry.handshake {
            if pending.is_confirmation(&packet) || packet_type == PacketType::Data {
                entry.handshake = None;
                if entry.session.establish() {
                    info!(session = %id, peer = %from, "session established");
                    if let Some(accepted) = &state.accepted {
                        if accepted.send(entry.handle()).is_err() {
                            debug!(session = %id, "listener gone, session not announced");
                        }
                    }
                }
            }
        }

        match packet_type {
            PacketType::Data => {
                let sequence = packet.sequence();
                match entry.session.on_data(packet, now) {
                    DataOutcome::Accepted { ack, delivered } => {
                        for _ in 0..delivered {
                            entry.signal.notify.notify_one();
                        }
                        out.push((ack, from));
                    }
                    DataOutcome::Duplicate { ack } => {
                        debug!(session = %id, sequence, "duplicate data re-acknowledged");
                        out.push((ack, from));
                    }
                    DataOutcome::Refused { reason } => {
                        debug!(session = %id, sequence, reason, "data refused, not acknowledged");
                    }
                }
            }
            PacketType::Ack => {
                if let Some(message_id) = entry.session.on_ack(packet.sequence(), now) {
                    if let Some(waiter) = entry.waiters.remove(&message_id) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            _ => {
                entry.session.touch(now);
                debug!(session = %id, %packet_type, "ignoring packet");
            }
        }
    }

    fn poll_sessions(&self, state: &mut EndpointState, now: Instant, out: &mut Outgoing) {
        let idle_timeout = self.config.idle_timeout();
        let mut dead: Vec<(SessionId, Teardown)> = Vec::new();

        for (id, entry) in state.sessions.iter_mut() {
            let peer = entry.session.peer;

            if let Some(pending) = entry.handshake.as_mut() {
                if let Some(response) = pending.poll(now) {
                    out.push((response, peer));
                }
            }

            let outcome = entry.session.poll(now);
            if let Some(failure) = outcome.failed {
                warn!(
                    session = %id,
                    sequence = failure.sequence,
                    retries = failure.retries,
                    "delivery failed, closing session"
                );
                dead.push((*id, Teardown::Failed(failure)));
                continue;
            }
            for packet in outcome.retransmit {
                EndpointStats::bump(&self.stats.retransmissions);
                debug!(session = %id, sequence = packet.sequence(), "retransmitting");
                out.push((packet, peer));
            }

            if entry.session.is_idle(now, idle_timeout) {
                info!(session = %id, %peer, "session idle, closing");
                dead.push((*id, Teardown::Idle));
            }
        }

        for (id, teardown) in dead {
            self.finish(state, id, teardown, out);
        }
    }

    fn poll_handshakes(&self, state: &mut EndpointState, now: Instant, out: &mut Outgoing) {
        let mut expired = Vec::new();
        for (nonce, pending) in state.connecting.iter_mut() {
            match pending.handshake.poll(now) {
                HandshakePoll::Waiting => {}
                HandshakePoll::Retransmit(request) => {
                    debug!(
                        peer = %pending.handshake.peer(),
                        attempt = pending.handshake.attempts(),
                        "retrying handshake"
                    );
                    out.push((request, pending.handshake.peer()));
                }
                HandshakePoll::TimedOut { attempts } => expired.push((*nonce, attempts)),
            }
        }

        for (nonce, attempts) in expired {
            if let Some(pending) = state.connecting.remove(&nonce) {
                let peer = pending.handshake.peer();
                warn!(%peer, attempts, "handshake timed out");
                let _ = pending
                    .reply
                    .send(Err(TransportError::HandshakeTimeout { peer, attempts }));
            }
        }
    }

    /// Remove a session, fail its waiters and wake its receivers.
    fn finish(
        &self,
        state: &mut EndpointState,
        id: SessionId,
        teardown: Teardown,
        out: &mut Outgoing,
    ) {
        let Some(mut entry) = state.sessions.remove(&id) else {
            return;
        };
        let peer = entry.session.peer;
        if let Some(nonce) = entry.session.handshake_nonce {
            state.half_open.remove(&(peer, nonce));
        }

        entry.session.close();
        if let Some(reason) = teardown.notice() {
            out.push((Packet::error(id, 0, reason), peer));
        }

        for (message_id, waiter) in entry.waiters.drain() {
            let err = match teardown {
                Teardown::Failed(failure) if failure.message_id == message_id => {
                    TransportError::MaxRetriesExceeded {
                        sequence: failure.sequence,
                        retries: failure.retries,
                    }
                }
                _ => TransportError::SessionClosed,
            };
            let _ = waiter.send(Err(err));
        }

        let unread = if teardown.keeps_unread() {
            entry.session.take_inbox()
        } else {
            VecDeque::new()
        };
        entry.session.mark_closed();
        info!(session = %id, %peer, ?teardown, unread = unread.len(), "session closed");
        entry.signal.close(unread);
        EndpointStats::bump(&self.stats.sessions_closed);
    }
}

/// Find the live session behind `handle`.
fn lookup<'a>(
    state: &'a mut EndpointState,
    handle: &SessionHandle,
) -> TransportResult<&'a mut SessionEntry> {
    match state.sessions.get_mut(&handle.id) {
        Some(entry) if Arc::ptr_eq(&entry.signal, &handle.signal) => Ok(entry),
        _ if handle.signal.is_closed() => Err(TransportError::SessionClosed),
        _ => Err(TransportError::UnknownSession(handle.id)),
    }
}
