use crate::bit_buffer::{BitReader, BitWriter};
use crate::connection::ConnectionStatus;
use bitflags::bitflags;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::time::Instant;

/// Per-message delivery semantics. Sequenced and ordered classes are multiplexed over
///  [DeliveryMethod::channel_count] independent sub-channels.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DeliveryMethod {
    /// no guarantees whatsoever
    Unreliable,
    /// unreliable, but late messages are dropped
    UnreliableSequenced,
    /// guaranteed delivery in arbitrary order
    ReliableUnordered,
    /// guaranteed delivery of the *latest* message; late messages are dropped
    ReliableSequenced,
    /// guaranteed delivery in submission order
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn channel_count(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
            DeliveryMethod::UnreliableSequenced
            | DeliveryMethod::ReliableSequenced
            | DeliveryMethod::ReliableOrdered => 32,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }
}

/// The 8-bit message type tag of the wire header (§ wire format in the crate docs).
///
/// Tags 0..=98 are user payloads keyed by delivery class and sub-channel, tags 128 and up are
///  library control messages. The space in between is reserved.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) enum MessageType {
    UnconnectedData,
    User(DeliveryMethod, u8),
    Ping,
    Pong,
    Connect,
    ConnectResponse,
    ConnectionEstablished,
    Acknowledge,
    Disconnect,
    Discovery,
    DiscoveryResponse,
    NatPunch,
    NatIntroduction,
    ExpandMtuRequest,
    ExpandMtuSuccess,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        match self {
            MessageType::UnconnectedData => 0,
            MessageType::User(DeliveryMethod::Unreliable, _) => 1,
            MessageType::User(DeliveryMethod::UnreliableSequenced, ch) => 2 + ch,
            MessageType::User(DeliveryMethod::ReliableUnordered, _) => 34,
            MessageType::User(DeliveryMethod::ReliableSequenced, ch) => 35 + ch,
            MessageType::User(DeliveryMethod::ReliableOrdered, ch) => 67 + ch,
            MessageType::Ping => 128,
            MessageType::Pong => 129,
            MessageType::Connect => 130,
            MessageType::ConnectResponse => 131,
            MessageType::ConnectionEstablished => 132,
            MessageType::Acknowledge => 134,
            MessageType::Disconnect => 135,
            MessageType::Discovery => 136,
            MessageType::DiscoveryResponse => 137,
            MessageType::NatPunch => 138,
            MessageType::NatIntroduction => 139,
            MessageType::ExpandMtuRequest => 140,
            MessageType::ExpandMtuSuccess => 141,
        }
    }

    pub fn from_tag(tag: u8) -> Option<MessageType> {
        match tag {
            0 => Some(MessageType::UnconnectedData),
            1 => Some(MessageType::User(DeliveryMethod::Unreliable, 0)),
            2..=33 => Some(MessageType::User(DeliveryMethod::UnreliableSequenced, tag - 2)),
            34 => Some(MessageType::User(DeliveryMethod::ReliableUnordered, 0)),
            35..=66 => Some(MessageType::User(DeliveryMethod::ReliableSequenced, tag - 35)),
            67..=98 => Some(MessageType::User(DeliveryMethod::ReliableOrdered, tag - 67)),
            128 => Some(MessageType::Ping),
            129 => Some(MessageType::Pong),
            130 => Some(MessageType::Connect),
            131 => Some(MessageType::ConnectResponse),
            132 => Some(MessageType::ConnectionEstablished),
            134 => Some(MessageType::Acknowledge),
            135 => Some(MessageType::Disconnect),
            136 => Some(MessageType::Discovery),
            137 => Some(MessageType::DiscoveryResponse),
            138 => Some(MessageType::NatPunch),
            139 => Some(MessageType::NatIntroduction),
            140 => Some(MessageType::ExpandMtuRequest),
            141 => Some(MessageType::ExpandMtuSuccess),
            _ => None,
        }
    }

    pub fn is_library(self) -> bool {
        !matches!(
            self,
            MessageType::UnconnectedData | MessageType::User(_, _)
        )
    }
}

/// An encoded payload ready for the wire. Reliable senders keep one `Arc` per retransmission
///  slot, so the strong count acts as the recycling reference count: the backing buffer is
///  freed exactly once, when the last slot or queue reference is dropped.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WirePayload {
    pub data: Vec<u8>,
    pub bit_len: usize,
    pub is_fragment: bool,
}

impl WirePayload {
    pub fn new(data: Vec<u8>, bit_len: usize) -> Arc<WirePayload> {
        Arc::new(WirePayload {
            data,
            bit_len,
            is_fragment: false,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8)
    }
}

/// A user message under construction. Dereferences to [BitWriter] for payload writing.
#[derive(Default, Debug)]
pub struct OutgoingMessage {
    writer: BitWriter,
}

impl OutgoingMessage {
    pub fn new() -> OutgoingMessage {
        OutgoingMessage::default()
    }

    pub fn with_capacity(capacity_bytes: usize) -> OutgoingMessage {
        OutgoingMessage {
            writer: BitWriter::with_capacity(capacity_bytes),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> OutgoingMessage {
        let mut writer = BitWriter::with_capacity(bytes.len());
        writer.write_bytes(bytes);
        OutgoingMessage { writer }
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, usize) {
        self.writer.into_parts()
    }
}

impl Deref for OutgoingMessage {
    type Target = BitWriter;
    fn deref(&self) -> &BitWriter {
        &self.writer
    }
}
impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut BitWriter {
        &mut self.writer
    }
}

/// Handle identifying a connection towards the application. Stable for the lifetime of the
///  connection, including across the handshake port-rebind case (the handle keeps the address
///  the connection was initiated with).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub(crate) SocketAddr);

impl ConnectionId {
    pub fn remote_addr(self) -> SocketAddr {
        self.0
    }
}
impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn[{}]", self.0)
    }
}

/// What a released message represents.
#[derive(Clone, Debug, PartialEq)]
pub enum IncomingKind {
    /// user payload on an established connection
    Data,
    /// user payload from an endpoint without a connection
    UnconnectedData,
    StatusChanged {
        status: ConnectionStatus,
        reason: String,
    },
    /// a remote peer wants to connect and the application decides (see `Peer::approve` / `Peer::deny`)
    ConnectionApproval,
    DiscoveryRequest,
    DiscoveryResponse,
    NatIntroductionSuccess {
        token: String,
    },
    /// a non-fatal protocol irregularity, surfaced when enabled
    Warning,
}

bitflags! {
    /// Which kinds of non-data events are released to the application.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct IncomingKinds: u16 {
        const DATA                     = 0x0001;
        const UNCONNECTED_DATA         = 0x0002;
        const STATUS_CHANGED           = 0x0004;
        const CONNECTION_APPROVAL      = 0x0008;
        const DISCOVERY_REQUEST        = 0x0010;
        const DISCOVERY_RESPONSE       = 0x0020;
        const NAT_INTRODUCTION_SUCCESS = 0x0040;
        const WARNING                  = 0x0080;
    }
}

impl IncomingKind {
    pub(crate) fn flag(&self) -> IncomingKinds {
        match self {
            IncomingKind::Data => IncomingKinds::DATA,
            IncomingKind::UnconnectedData => IncomingKinds::UNCONNECTED_DATA,
            IncomingKind::StatusChanged { .. } => IncomingKinds::STATUS_CHANGED,
            IncomingKind::ConnectionApproval => IncomingKinds::CONNECTION_APPROVAL,
            IncomingKind::DiscoveryRequest => IncomingKinds::DISCOVERY_REQUEST,
            IncomingKind::DiscoveryResponse => IncomingKinds::DISCOVERY_RESPONSE,
            IncomingKind::NatIntroductionSuccess { .. } => IncomingKinds::NAT_INTRODUCTION_SUCCESS,
            IncomingKind::Warning => IncomingKinds::WARNING,
        }
    }
}

/// A message released to the application.
#[derive(Debug)]
pub struct IncomingMessage {
    pub kind: IncomingKind,
    /// endpoint the datagram came from
    pub sender_addr: Option<SocketAddr>,
    /// set when the message belongs to a connection
    pub connection: Option<ConnectionId>,
    /// delivery class and sub-channel for [IncomingKind::Data]
    pub delivery: Option<(DeliveryMethod, u8)>,
    pub receive_time: Instant,
    pub(crate) data: Vec<u8>,
    pub(crate) bit_len: usize,
    pub(crate) is_fragment: bool,
}

impl IncomingMessage {
    pub(crate) fn new(kind: IncomingKind, data: Vec<u8>, bit_len: usize, receive_time: Instant) -> IncomingMessage {
        IncomingMessage {
            kind,
            sender_addr: None,
            connection: None,
            delivery: None,
            receive_time,
            data,
            bit_len,
            is_fragment: false,
        }
    }

    /// Raw payload bytes, the last byte zero-padded if the bit length is not a multiple of 8.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn bit_length(&self) -> usize {
        self.bit_len
    }

    pub fn reader(&self) -> BitReader<'_> {
        BitReader::new(&self.data, self.bit_len)
    }

    pub(crate) fn into_payload_buffer(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unconnected(MessageType::UnconnectedData, 0)]
    #[case::unreliable(MessageType::User(DeliveryMethod::Unreliable, 0), 1)]
    #[case::sequenced_0(MessageType::User(DeliveryMethod::UnreliableSequenced, 0), 2)]
    #[case::sequenced_31(MessageType::User(DeliveryMethod::UnreliableSequenced, 31), 33)]
    #[case::rel_unordered(MessageType::User(DeliveryMethod::ReliableUnordered, 0), 34)]
    #[case::rel_sequenced_5(MessageType::User(DeliveryMethod::ReliableSequenced, 5), 40)]
    #[case::rel_ordered_0(MessageType::User(DeliveryMethod::ReliableOrdered, 0), 67)]
    #[case::rel_ordered_31(MessageType::User(DeliveryMethod::ReliableOrdered, 31), 98)]
    #[case::ping(MessageType::Ping, 128)]
    #[case::ack(MessageType::Acknowledge, 134)]
    #[case::expand_mtu(MessageType::ExpandMtuSuccess, 141)]
    fn test_tag_roundtrip(#[case] msg_type: MessageType, #[case] expected_tag: u8) {
        assert_eq!(msg_type.tag(), expected_tag);
        assert_eq!(MessageType::from_tag(expected_tag), Some(msg_type));
    }

    #[rstest]
    #[case::reserved_gap(99)]
    #[case::reserved_127(127)]
    #[case::skipped_133(133)]
    #[case::above(142)]
    #[case::max(255)]
    fn test_unknown_tags(#[case] tag: u8) {
        assert_eq!(MessageType::from_tag(tag), None);
    }

    #[test]
    fn test_outgoing_message_payload() {
        let mut msg = OutgoingMessage::new();
        msg.write_u16(0x0102);
        msg.write_bool(true);

        let (data, bit_len) = msg.into_parts();
        assert_eq!(bit_len, 17);
        assert_eq!(data, vec![0x02, 0x01, 0x01]);
    }
}
