//! Wire-level handshake tests against a hand-rolled remote: proves the on-wire layout stays
//!  stable, that a handshake follows a remote port rebind, and that a silent remote runs the
//!  connection into its timeout.

mod common;

use common::test_config;
use reludp::{BitReader, BitWriter, ConnectionStatus, IncomingKind, Peer};
use std::time::Duration;
use tokio::net::UdpSocket;

// message type tags as they appear on the wire
const TAG_CONNECT: u8 = 130;
const TAG_CONNECT_RESPONSE: u8 = 131;
const TAG_CONNECTION_ESTABLISHED: u8 = 132;

/// one message with sequence 0 and no fragment flag, framed as a datagram
fn wire_datagram(tag: u8, payload: &BitWriter) -> Vec<u8> {
    let mut datagram = vec![tag, 0, 0];
    datagram.extend_from_slice(&(payload.bit_len() as u16).to_le_bytes());
    datagram.extend_from_slice(payload.as_bytes());
    datagram
}

struct WireMessage {
    tag: u8,
    payload: Vec<u8>,
    payload_bits: u16,
}

fn parse_first_message(datagram: &[u8]) -> WireMessage {
    assert!(datagram.len() >= 5, "datagram shorter than one header");
    let tag = datagram[0];
    let payload_bits = u16::from_le_bytes([datagram[3], datagram[4]]);
    let payload_len = (payload_bits as usize).div_ceil(8);
    WireMessage {
        tag,
        payload: datagram[5..5 + payload_len].to_vec(),
        payload_bits,
    }
}

struct ParsedConnect {
    app_identifier: String,
    app_version: u32,
    nonce: u32,
}

fn parse_connect(msg: &WireMessage) -> ParsedConnect {
    assert_eq!(msg.tag, TAG_CONNECT);
    let mut r = BitReader::new(&msg.payload, msg.payload_bits as usize);
    let app_identifier = r.read_string().unwrap();
    let app_version = r.read_var_u32().unwrap();
    let _peer_id = r.read_u64().unwrap();
    let nonce = r.read_u32().unwrap();
    ParsedConnect {
        app_identifier,
        app_version,
        nonce,
    }
}

fn connect_response(app_identifier: &str, app_version: u32, nonce: u32) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_string(app_identifier);
    w.write_var_u32(app_version);
    w.write_u64(0x5150);
    w.write_u32(nonce);
    wire_datagram(TAG_CONNECT_RESPONSE, &w)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_against_raw_socket() {
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let peer = Peer::start(test_config("wire-app")).await.unwrap();
    peer.connect(remote.local_addr().unwrap()).unwrap();

    // the Connect carries our app identifier and version
    let mut buf = vec![0u8; 2048];
    let (len, from) = remote.recv_from(&mut buf).await.unwrap();
    let connect = parse_connect(&parse_first_message(&buf[..len]));
    assert_eq!(connect.app_identifier, "wire-app");
    assert_eq!(connect.app_version, 0);
    assert_eq!(from, peer.local_addr());

    // answer with a matching response; the peer must complete with ConnectionEstablished
    remote
        .send_to(&connect_response("wire-app", 0, connect.nonce), from)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no ConnectionEstablished before the deadline");
        let (len, _) = tokio::time::timeout(remaining, remote.recv_from(&mut buf))
            .await
            .expect("no ConnectionEstablished before the deadline")
            .unwrap();
        if parse_first_message(&buf[..len]).tag == TAG_CONNECTION_ESTABLISHED {
            break;
        }
    }

    common::wait_for_status(&peer, ConnectionStatus::Connected).await;
    peer.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_response_from_rebound_port_is_followed() {
    let original = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rebound = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let peer = Peer::start(test_config("wire-app")).await.unwrap();
    let conn = peer.connect(original.local_addr().unwrap()).unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, from) = original.recv_from(&mut buf).await.unwrap();
    let connect = parse_connect(&parse_first_message(&buf[..len]));

    // respond from a different port, as a NAT re-binding the mapping would
    rebound
        .send_to(&connect_response("wire-app", 0, connect.nonce), from)
        .await
        .unwrap();

    // the peer follows the rebind: the ConnectionEstablished arrives at the new port
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no ConnectionEstablished at the rebound port");
        let (len, _) = tokio::time::timeout(remaining, rebound.recv_from(&mut buf))
            .await
            .expect("no ConnectionEstablished at the rebound port")
            .unwrap();
        if parse_first_message(&buf[..len]).tag == TAG_CONNECTION_ESTABLISHED {
            break;
        }
    }

    // the application still sees the handle it started with
    let (reported, _) = common::wait_for_status(&peer, ConnectionStatus::Connected).await;
    assert_eq!(reported, conn);

    peer.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_remote_times_out() {
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut config = test_config("wire-app");
    config.connection_timeout = Duration::from_secs(3);
    config.ping_interval = Duration::from_secs(1);
    let peer = Peer::start(config).await.unwrap();
    peer.connect(remote.local_addr().unwrap()).unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, from) = remote.recv_from(&mut buf).await.unwrap();
    let connect = parse_connect(&parse_first_message(&buf[..len]));
    remote
        .send_to(&connect_response("wire-app", 0, connect.nonce), from)
        .await
        .unwrap();

    common::wait_for_status(&peer, ConnectionStatus::Connected).await;
    let connected_at = tokio::time::Instant::now();

    // from here on the remote plays dead; pings and probes go unanswered
    let (_, reason) = common::wait_for_status(&peer, ConnectionStatus::Disconnected).await;
    assert_eq!(reason, "timeout");
    let elapsed = connected_at.elapsed();
    assert!(
        elapsed <= Duration::from_secs(4),
        "timeout took {:?}, expected at most connection_timeout + 1s",
        elapsed
    );

    peer.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_app_version_is_rejected_with_reason() {
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let peer = Peer::start(test_config("wire-app")).await.unwrap();
    peer.connect(remote.local_addr().unwrap()).unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, from) = remote.recv_from(&mut buf).await.unwrap();
    let connect = parse_connect(&parse_first_message(&buf[..len]));

    // respond with the right app but the wrong version
    remote
        .send_to(&connect_response("wire-app", 1, connect.nonce), from)
        .await
        .unwrap();

    let (_, reason) = common::wait_for_status(&peer, ConnectionStatus::Disconnected).await;
    assert_eq!(reason, "wrong application version");

    peer.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unanswered_connect_gives_up_with_timeout() {
    // nothing listens here (bind a socket to reserve the port, then never read it)
    let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut config = test_config("wire-app");
    config.resend_handshake_interval = Duration::from_millis(100);
    config.maximum_handshake_attempts = 3;
    let peer = Peer::start(config).await.unwrap();
    peer.connect(blackhole.local_addr().unwrap()).unwrap();

    let msg = peer
        .read_message_timeout(Duration::from_secs(10))
        .await
        .expect("expected a status change");
    assert!(matches!(
        msg.kind,
        IncomingKind::StatusChanged {
            status: ConnectionStatus::Disconnected,
            ref reason,
        } if reason == "timeout"
    ));

    peer.shutdown("done").await;
}
