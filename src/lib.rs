//! A connection-oriented reliable messaging library on top of UDP.
//!
//! Peers exchange application *messages* (defined-length chunks of data, not byte streams)
//!  with a per-message choice of delivery semantics across independent sub-channels, while the
//!  library transparently handles connect/disconnect handshakes, keepalive and RTT
//!  estimation, MTU discovery, fragmentation of oversize payloads, duplicate suppression,
//!  retransmission, and NAT traversal helpers.
//!
//! ## Design goals
//!
//! * One UDP socket per [Peer]; any number of logical connections multiplexed over it,
//!   IPv4 or IPv6.
//! * Per-message delivery semantics ([DeliveryMethod]): fire-and-forget, drop-late-arrivals,
//!   reliable in any order, reliable latest-only, and reliable in order - the application
//!   picks per message, not per connection.
//! * Reliability through Selective-Repeat ARQ with a fixed window per channel: positive
//!   acknowledgements, resend timers derived from a smoothed RTT, and eager retransmission
//!   of holes revealed by early acks.
//! * Exactly one network worker task owns the socket and every piece of connection state;
//!   application threads interact only through queues. No locks on the hot path.
//! * No per-datagram allocation in the steady state: datagram buffers are reused, incoming
//!   payload buffers are pooled and recycled via [Peer::recycle].
//!
//! ## Wire format
//!
//! Every UDP datagram is a concatenation of messages. Each message starts with a fixed
//!  5-byte header; multi-byte integers are little-endian:
//!
//! ```ascii
//! 0:    message type tag (u8): user payload tags keyed by delivery class and sub-channel,
//!        or a library control message (connect/ack/ping/MTU probe/...)
//! 1:    bit 0: fragment flag
//!       bits 1..7: low 7 bits of the 15-bit sequence number
//! 2:    high 8 bits of the sequence number
//! 3..4: payload length in bits (u16)
//! ```
//!
//! When the fragment flag is set, the payload starts with a varint fragment header
//!  (group id, total bits, chunk size, chunk number) followed by the chunk bytes.
//!
//! An Acknowledge message's payload is a sequence of `(channel tag u8, sequence u16)`
//!  pairs, as many as fit under the current MTU.
//!
//! ## Connecting
//!
//! The handshake is a three-way exchange - Connect, ConnectResponse, ConnectionEstablished -
//!  carrying the application identifier, application version, a random nonce and the 64-bit
//!  peer id. Mismatched identifiers or versions are answered with a Disconnect carrying the
//!  reason. Handshake messages are retransmitted with a doubling delay up to a configured
//!  attempt limit. Status progress is surfaced to the application as
//!  [IncomingKind::StatusChanged] messages.
//!
//! ## Getting started
//!
//! ```no_run
//! use reludp::{DeliveryMethod, OutgoingMessage, Peer, PeerConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut config = PeerConfig::new("my-app");
//! config.port = 14242;
//! config.accept_incoming_connections = true;
//! let peer = Peer::start(config).await?;
//!
//! let conn = peer.connect("127.0.0.1:14243".parse()?)?;
//! let mut msg = OutgoingMessage::new();
//! msg.write_string("hello");
//! peer.send_message(conn, msg, DeliveryMethod::ReliableOrdered, 0)?;
//!
//! while let Some(incoming) = peer.read_message().await {
//!     println!("{:?}", incoming.kind);
//!     peer.recycle(incoming);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bit_buffer;
pub mod config;
mod connection;
mod control_messages;
mod fragmentation;
mod message;
mod message_header;
mod message_pool;
mod peer;
mod receiver_channel;
mod send_pipeline;
mod sender_channel;
pub mod seq;
pub mod statistics;

pub use bit_buffer::{BitReader, BitWriter};
pub use config::{LinkSimulation, PeerConfig};
pub use connection::ConnectionStatus;
pub use message::{
    ConnectionId, DeliveryMethod, IncomingKind, IncomingKinds, IncomingMessage, OutgoingMessage,
};
pub use peer::Peer;
pub use statistics::{ConnectionStatistics, PeerStatistics};
