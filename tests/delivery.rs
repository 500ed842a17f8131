//! Reliable and fragmented delivery over loopback.

mod common;

use std::time::Duration;

use common::{FakePeer, client, fast_config, server};
use cof_transport::prelude::*;
use cof_transport::transport::FragmentInfo;
use cof_transport::{Packet, PacketType};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_fragmented_round_trip() {
    let config = fast_config().max_payload_size(100).build().unwrap();
    let (server, mut incoming, addr) = server(config.clone()).await;
    let client = client(config).await;

    let session = client.connect(addr).await.unwrap();
    let remote = incoming.accept().await.unwrap();

    // 50 fragments, the last one partial
    let upload = pattern(4_950);
    client.send(&session, &upload).await.unwrap();
    assert_eq!(server.receive(&remote).await.unwrap(), upload);

    let download = pattern(250);
    server.send(&remote, &download).await.unwrap();
    assert_eq!(client.receive(&session).await.unwrap(), download);
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let config = fast_config().max_payload_size(64).build().unwrap();
    let (server, mut incoming, addr) = server(config.clone()).await;
    let client = client(config).await;

    let session = client.connect(addr).await.unwrap();
    let remote = incoming.accept().await.unwrap();

    let messages: Vec<Vec<u8>> = (1..=5).map(|n| pattern(n * 50)).collect();
    for message in &messages {
        client.send(&session, message).await.unwrap();
    }
    for message in &messages {
        assert_eq!(&server.receive(&remote).await.unwrap(), message);
    }
}

#[tokio::test]
async fn test_empty_message() {
    let config = fast_config().build().unwrap();
    let (server, mut incoming, addr) = server(config.clone()).await;
    let client = client(config).await;

    let session = client.connect(addr).await.unwrap();
    let remote = incoming.accept().await.unwrap();

    client.send(&session, b"").await.unwrap();
    assert!(server.receive(&remote).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_max_retries_against_silent_peer() {
    let config = fast_config().max_retries(2).build().unwrap();
    let fake = FakePeer::bind().await;
    let fake_addr = fake.addr();
    let client = client(config).await;

    // Completes the handshake, then never acknowledges anything
    let fake_task = tokio::spawn(async move {
        let (request, from) = fake.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(request.packet_type(), PacketType::HandshakeRequest);
        let id = SessionId::new(0x5eed);
        fake.send(&Packet::handshake_response(id, request.sequence()), from)
            .await;

        let mut data = Vec::new();
        let mut notice = None;
        while let Some((packet, _)) = fake.recv(Duration::from_millis(500)).await {
            match packet.packet_type() {
                PacketType::Data => data.push(packet),
                PacketType::Error => notice = Some(packet),
                _ => {}
            }
        }
        (data, notice)
    });

    let session = client.connect(fake_addr).await.unwrap();
    match client.send(&session, b"nobody listens").await {
        Err(TransportError::MaxRetriesExceeded { sequence, retries }) => {
            assert_eq!(sequence, 1);
            assert_eq!(retries, 2);
        }
        other => panic!("expected MaxRetriesExceeded, got {other:?}"),
    }

    // The session is unrecoverable
    assert_eq!(
        client.session_state(&session).await.unwrap(),
        SessionState::Closed
    );
    assert!(matches!(
        client.send(&session, b"again").await,
        Err(TransportError::SessionClosed)
    ));

    let (data, notice) = fake_task.await.unwrap();
    // One transmission plus two retransmissions of the same packet
    assert_eq!(data.len(), 3);
    assert!(data.iter().all(|p| p.sequence() == 1 && p.payload() == b"nobody listens"));
    let notice = notice.expect("error notice after giving up");
    assert_eq!(notice.payload(), b"max retries exceeded");

    assert_eq!(client.stats().unwrap().retransmissions, 2);
}

#[tokio::test]
async fn test_lost_packet_is_retransmitted() {
    let config = fast_config().max_retries(3).build().unwrap();
    let fake = FakePeer::bind().await;
    let fake_addr = fake.addr();
    let client = client(config).await;

    // Completes the handshake, ignores the first DATA and acknowledges the second
    let fake_task = tokio::spawn(async move {
        let (request, from) = fake.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(request.packet_type(), PacketType::HandshakeRequest);
        let id = SessionId::new(0x1057);
        fake.send(&Packet::handshake_response(id, request.sequence()), from)
            .await;

        let lost = fake
            .recv_type(PacketType::Data, Duration::from_secs(2))
            .await
            .unwrap();
        let resent = fake
            .recv_type(PacketType::Data, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resent.sequence(), lost.sequence());
        fake.send(&Packet::ack(id, resent.sequence()), from).await;
        resent.payload().to_vec()
    });

    let session = client.connect(fake_addr).await.unwrap();
    client.send(&session, b"lost once").await.unwrap();
    assert_eq!(fake_task.await.unwrap(), b"lost once");

    assert_eq!(client.stats().unwrap().retransmissions, 1);
    assert_eq!(
        client.session_state(&session).await.unwrap(),
        SessionState::Established
    );
}

#[tokio::test]
async fn test_refused_fragment_is_not_acknowledged() {
    let config = fast_config().build().unwrap();
    let (server, mut incoming, addr) = server(config).await;
    let peer = FakePeer::bind().await;

    let id = peer.handshake(addr, 13).await;
    let session = incoming.accept().await.unwrap();

    let first = Packet::data(id, 1, FragmentInfo { index: 0, count: 2 }, b"ab".to_vec());
    peer.send(&first.unwrap(), addr).await;
    let ack = peer
        .recv_type(PacketType::Ack, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ack.sequence(), 1);

    // Disagrees with the message's fragment count: dropped silently
    let bogus = Packet::data(id, 2, FragmentInfo { index: 1, count: 3 }, b"??".to_vec());
    peer.send(&bogus.unwrap(), addr).await;
    assert!(
        peer.recv_type(PacketType::Ack, Duration::from_millis(200))
            .await
            .is_none()
    );

    let second = Packet::data(id, 2, FragmentInfo { index: 1, count: 2 }, b"cd".to_vec());
    peer.send(&second.unwrap(), addr).await;
    let ack = peer
        .recv_type(PacketType::Ack, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ack.sequence(), 2);
    assert_eq!(server.receive(&session).await.unwrap(), b"abcd");
}

#[tokio::test]
async fn test_duplicate_data_delivered_once() {
    let config = fast_config()
        .receive_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let (server, mut incoming, addr) = server(config).await;
    let peer = FakePeer::bind().await;

    let id = peer.handshake(addr, 7).await;
    let session = incoming.accept().await.unwrap();

    let data = Packet::data(id, 1, FragmentInfo::WHOLE, b"once".to_vec()).unwrap();
    peer.send(&data, addr).await;
    peer.send(&data, addr).await;

    // Both copies are acknowledged
    for _ in 0..2 {
        let ack = peer
            .recv_type(PacketType::Ack, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ack.session_id(), id);
        assert_eq!(ack.sequence(), 1);
    }

    assert_eq!(server.receive(&session).await.unwrap(), b"once");
    assert!(matches!(
        server.receive(&session).await,
        Err(TransportError::Timeout)
    ));
}

#[tokio::test]
async fn test_out_of_order_fragments_reassemble() {
    let config = fast_config().build().unwrap();
    let (server, mut incoming, addr) = server(config).await;
    let peer = FakePeer::bind().await;

    let id = peer.handshake(addr, 9).await;
    let session = incoming.accept().await.unwrap();

    // Message id 1 split over sequences 1..=3, sent last-first
    let parts: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];
    for index in (0..3u16).rev() {
        let fragment = FragmentInfo { index, count: 3 };
        let packet =
            Packet::data(id, 1 + u32::from(index), fragment, parts[index as usize].to_vec())
                .unwrap();
        peer.send(&packet, addr).await;
    }

    assert_eq!(server.receive(&session).await.unwrap(), b"alpha-beta-gamma");
}
