//! Async UDP socket wrapper for the Cof transport.
//!
//! The socket is shared between the endpoint's driver task, which is the
//! only reader, and foreground operations that write. Each packet goes out
//! as a single datagram, so concurrent writers never interleave.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::trace;

use super::codec;
use super::packet::Packet;

/// Async UDP socket carrying Cof packets.
#[derive(Debug)]
pub struct CofSocket {
    socket: UdpSocket,
}

impl CofSocket {
    /// Bind a socket to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Encode and send one packet.
    pub async fn send_packet(&self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        trace!(
            packet_type = %packet.packet_type(),
            session = %packet.session_id(),
            sequence = packet.sequence(),
            %addr,
            "send"
        );
        self.socket.send_to(&codec::encode(packet), addr).await
    }

    /// Receive one datagram into `buf`, returning its length and sender.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MAX_DATAGRAM_SIZE;
    use crate::transport::packet::SessionId;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = CofSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[tokio::test]
    async fn test_socket_send_recv_packet() {
        let server = CofSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = CofSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let packet = Packet::ack(SessionId::new(3), 11);
        client.send_packet(&packet, server_addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(codec::decode(&buf[..len]).unwrap(), packet);
    }
}
