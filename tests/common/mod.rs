//! Shared helpers for loopback integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use cof_transport::core::{MAX_DATAGRAM_SIZE, TransportConfigBuilder};
use cof_transport::prelude::*;
use cof_transport::transport::codec;
use cof_transport::{Packet, PacketType};
use tokio::net::UdpSocket;

pub const LOOPBACK: &str = "127.0.0.1:0";

/// Short timers so failure paths finish quickly.
pub fn fast_config() -> TransportConfigBuilder {
    TransportConfigBuilder::new()
        .retransmit_timeout(Duration::from_millis(50))
        .receive_timeout(Duration::from_secs(2))
        .poll_interval(Duration::from_millis(5))
}

pub async fn server(config: TransportConfig) -> (CofServer, Incoming, SocketAddr) {
    let mut server = CofServer::new(config);
    let incoming = server.listen(LOOPBACK.parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, incoming, addr)
}

pub async fn client(config: TransportConfig) -> CofClient {
    CofClient::bind(LOOPBACK.parse().unwrap(), config).await.unwrap()
}

/// A raw UDP socket speaking the wire format by hand.
pub struct FakePeer {
    pub socket: UdpSocket,
}

impl FakePeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind(LOOPBACK).await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, packet: &Packet, to: SocketAddr) {
        self.socket
            .send_to(&codec::encode(packet), to)
            .await
            .unwrap();
    }

    /// Next decodable packet, or `None` after `wait` of silence.
    pub async fn recv(&self, wait: Duration) -> Option<(Packet, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .unwrap();
            if let Ok(packet) = codec::decode(&buf[..len]) {
                return Some((packet, from));
            }
        }
    }

    /// Next packet of the given type, skipping others.
    pub async fn recv_type(&self, packet_type: PacketType, wait: Duration) -> Option<Packet> {
        loop {
            let (packet, _) = self.recv(wait).await?;
            if packet.packet_type() == packet_type {
                return Some(packet);
            }
        }
    }

    /// Run the client side of the handshake against `server`.
    pub async fn handshake(&self, server: SocketAddr, nonce: u32) -> SessionId {
        self.send(&Packet::handshake_request(nonce), server).await;
        let response = self
            .recv_type(PacketType::HandshakeResponse, Duration::from_secs(2))
            .await
            .expect("handshake response");
        assert_eq!(response.sequence(), nonce);
        let id = response.session_id();
        self.send(&Packet::ack(id, nonce), server).await;
        id
    }
}
