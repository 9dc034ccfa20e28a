#![allow(dead_code)]

use reludp::{
    ConnectionId, ConnectionStatus, IncomingKind, IncomingMessage, Peer, PeerConfig,
};
use std::net::IpAddr;
use std::time::Duration;

/// Config bound to loopback with handshake timings tightened for tests.
pub fn test_config(app_identifier: &str) -> PeerConfig {
    let mut config = PeerConfig::new(app_identifier);
    config.local_address = IpAddr::from([127, 0, 0, 1]);
    config.resend_handshake_interval = Duration::from_millis(200);
    config
}

/// Start a server/client pair and wait until both sides report Connected. Returns both
///  peers plus the client-side and server-side connection handles.
pub async fn connect_pair(
    mut server_config: PeerConfig,
    client_config: PeerConfig,
) -> (Peer, Peer, ConnectionId, ConnectionId) {
    server_config.accept_incoming_connections = true;
    let server = Peer::start(server_config).await.expect("server start");
    let client = Peer::start(client_config).await.expect("client start");

    let client_conn = client.connect(server.local_addr()).expect("connect");
    wait_for_status(&client, ConnectionStatus::Connected).await;
    let (server_conn, _) = wait_for_status(&server, ConnectionStatus::Connected).await;

    (server, client, client_conn, server_conn)
}

/// Drain released messages until the wanted status change shows up.
pub async fn wait_for_status(peer: &Peer, wanted: ConnectionStatus) -> (ConnectionId, String) {
    loop {
        let msg = peer
            .read_message_timeout(Duration::from_secs(30))
            .await
            .unwrap_or_else(|| panic!("timed out waiting for status {:?}", wanted));
        if let IncomingKind::StatusChanged { status, ref reason } = msg.kind {
            if status == wanted {
                let conn = msg.connection.expect("status changes carry a connection");
                return (conn, reason.clone());
            }
        }
        peer.recycle(msg);
    }
}

/// Collect the payloads of the next `count` Data messages, in release order.
pub async fn receive_data(peer: &Peer, count: usize, total_deadline: Duration) -> Vec<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + total_deadline;
    let mut result = Vec::with_capacity(count);

    while result.len() < count {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| {
                panic!("deadline exceeded after {} of {} messages", result.len(), count)
            });
        let msg = peer
            .read_message_timeout(remaining)
            .await
            .unwrap_or_else(|| {
                panic!("timed out after {} of {} messages", result.len(), count)
            });
        if msg.kind == IncomingKind::Data {
            result.push(msg.payload().to_vec());
        }
        peer.recycle(msg);
    }
    result
}

/// Read everything released within `window`, returning only the Data payloads.
pub async fn drain_data_for(peer: &Peer, window: Duration) -> Vec<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + window;
    let mut result = Vec::new();
    loop {
        let remaining = match deadline.checked_duration_since(tokio::time::Instant::now()) {
            Some(remaining) => remaining,
            None => return result,
        };
        match peer.read_message_timeout(remaining).await {
            Some(msg) => {
                if msg.kind == IncomingKind::Data {
                    result.push(msg.payload().to_vec());
                }
                peer.recycle(msg);
            }
            None => return result,
        }
    }
}

pub fn expect_message(msg: &Option<IncomingMessage>) -> &IncomingMessage {
    msg.as_ref().expect("expected a released message")
}
