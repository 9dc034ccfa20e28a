//! Delivery guarantees over a degraded loopback link.

mod common;

use common::{connect_pair, drain_data_for, receive_data, test_config};
use reludp::{DeliveryMethod, OutgoingMessage};
use std::time::Duration;

fn indexed_message(index: u32) -> OutgoingMessage {
    let mut msg = OutgoingMessage::new();
    msg.write_u32(index);
    msg
}

fn indices_of(payloads: &[Vec<u8>]) -> Vec<u32> {
    payloads
        .iter()
        .map(|p| u32::from_le_bytes(p[..4].try_into().unwrap()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_delivery_under_loss() {
    let mut server_config = test_config("loss-test");
    server_config.simulation.loss_chance = 0.1;
    let mut client_config = test_config("loss-test");
    client_config.simulation.loss_chance = 0.1;

    let (server, client, conn, _server_conn) = connect_pair(server_config, client_config).await;

    const COUNT: u32 = 1000;
    for i in 0..COUNT {
        client
            .send_message(conn, indexed_message(i), DeliveryMethod::ReliableOrdered, 0)
            .unwrap();
    }

    let received = receive_data(&server, COUNT as usize, Duration::from_secs(60)).await;
    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(indices_of(&received), expected);

    client.shutdown("done").await;
    server.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicated_datagrams_are_invisible() {
    let server_config = test_config("dup-test");
    let mut client_config = test_config("dup-test");
    // nearly every datagram from the client goes out twice
    client_config.simulation.duplicate_chance = 0.95;

    let (server, client, conn, _server_conn) = connect_pair(server_config, client_config).await;

    const COUNT: u32 = 200;
    for i in 0..COUNT {
        client
            .send_message(conn, indexed_message(i), DeliveryMethod::ReliableOrdered, 0)
            .unwrap();
    }

    let received = receive_data(&server, COUNT as usize, Duration::from_secs(30)).await;
    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(indices_of(&received), expected);

    // and nothing beyond the expected 200 trickles in afterwards
    let extras = drain_data_for(&server, Duration::from_millis(500)).await;
    assert!(extras.is_empty(), "duplicates leaked through: {:?}", indices_of(&extras));

    client.shutdown("done").await;
    server.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_channels_do_not_block_each_other() {
    let (server, client, conn, _server_conn) = connect_pair(test_config("chan-test"), test_config("chan-test")).await;

    for i in 0..50u32 {
        let channel = (i % 3) as u8;
        client
            .send_message(conn, indexed_message(i), DeliveryMethod::ReliableOrdered, channel)
            .unwrap();
    }

    let received = receive_data(&server, 50, Duration::from_secs(30)).await;
    let indices = indices_of(&received);

    // per channel, the original order must be preserved
    for channel in 0..3u32 {
        let per_channel: Vec<u32> = indices.iter().copied().filter(|i| i % 3 == channel).collect();
        let expected: Vec<u32> = (0..50).filter(|i| i % 3 == channel).collect();
        assert_eq!(per_channel, expected, "channel {} out of order", channel);
    }

    client.shutdown("done").await;
    server.shutdown("done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequenced_messages_never_go_backwards() {
    let mut client_config = test_config("seq-test");
    // duplication plus latency jitter reorders datagrams on the wire
    client_config.simulation.duplicate_chance = 0.3;
    client_config.simulation.random_latency = Duration::from_millis(5);

    let (server, client, conn, _server_conn) = connect_pair(test_config("seq-test"), client_config).await;

    for i in 0..200u32 {
        client
            .send_message(conn, indexed_message(i), DeliveryMethod::UnreliableSequenced, 0)
            .unwrap();
        // pace the stream a little so not everything shares one datagram
        if i % 20 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let received = drain_data_for(&server, Duration::from_secs(2)).await;
    let indices = indices_of(&received);
    assert!(!indices.is_empty(), "nothing came through");
    for window in indices.windows(2) {
        assert!(
            window[1] > window[0],
            "sequenced stream went backwards: {:?}",
            window
        );
    }

    client.shutdown("done").await;
    server.shutdown("done").await;
}
