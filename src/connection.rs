//! Per-remote-peer state: the handshake state machine, heartbeat, ping/RTT estimation, MTU
//!  expansion, the per-channel senders and receivers, ack packing, and datagram assembly.
//!
//! A `Connection` is owned and driven exclusively by the peer's worker task; all methods take
//!  the send pipeline as a parameter so no upward reference to the peer exists.

use crate::bit_buffer::{BitReader, BitWriter};
use crate::config::PeerConfig;
use crate::control_messages::{
    ConnectPayload, ConnectResponsePayload, DisconnectPayload, ExpandMtuPayload, PingPayload,
};
use crate::fragmentation::{best_chunk_size, split_payload, FragmentAssembler, FragmentHeader};
use crate::message::{
    ConnectionId, DeliveryMethod, IncomingKind, IncomingMessage, MessageType, WirePayload,
};
use crate::message_header::MessageHeader;
use crate::message_pool::MessagePool;
use crate::receiver_channel::ReceiverChannel;
use crate::send_pipeline::SendPipeline;
use crate::sender_channel::{SendItem, SenderChannel};
use crate::seq::SeqNr;
use crate::statistics::ConnectionStatistics;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Lifecycle of a connection as observable through StatusChanged messages.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionStatus {
    /// created but no handshake traffic yet
    None,
    /// we sent a Connect and wait for the response
    InitiatedConnect,
    /// a remote Connect arrived and has not been answered yet
    ReceivedInitiation,
    /// a remote Connect awaits an application-level approve/deny decision
    RespondedAwaitingApproval,
    /// we answered with a ConnectResponse and wait for the ConnectionEstablished
    RespondedConnect,
    Connected,
    /// tearing down; a Disconnect datagram may still go out
    Disconnecting,
    Disconnected,
}

/// Sub-channel that carries fragment chunks, by convention the highest ordered channel.
const FRAGMENT_CHANNEL: u8 = 31;

/// lower bound of the resend delay, and its RTT-independent component
const MIN_RESEND_DELAY: Duration = Duration::from_millis(40);

struct MtuProbe {
    /// largest size known to pass
    low: usize,
    /// smallest size assumed (or known) to fail, plus one
    high: usize,
    candidate: usize,
    attempts_at_candidate: u32,
    /// None until the first probe goes out
    last_sent: Option<Instant>,
}

impl MtuProbe {
    fn new(low: usize, high: usize) -> MtuProbe {
        MtuProbe {
            low,
            high,
            candidate: (low + high + 1) / 2,
            attempts_at_candidate: 0,
            last_sent: None,
        }
    }
}

pub(crate) struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    status: ConnectionStatus,
    is_initiator: bool,
    config: Arc<PeerConfig>,
    local_peer_id: u64,
    remote_peer_id: Option<u64>,
    /// ours when initiating, echoed from the remote Connect when accepting
    nonce: u32,

    sender_channels: FxHashMap<u8, SenderChannel>,
    receiver_channels: FxHashMap<u8, ReceiverChannel>,

    /// `(message type tag, sequence)` pairs awaiting transmission in an Acknowledge message
    pending_acks: Vec<(u8, SeqNr)>,
    last_ack_sent: Instant,

    avg_rtt: Option<f32>,
    resend_delay: Duration,

    last_heard: Instant,
    timeout_deadline: Instant,

    /// None requests an immediate ping on the next heartbeat
    last_ping_sent: Option<Instant>,
    ping_number: u8,
    ping_sent_at: Instant,

    current_mtu: usize,
    mtu_probe: Option<MtuProbe>,

    handshake_attempts: u32,
    last_handshake_sent: Instant,
    handshake_resend_delay: Duration,

    /// datagram under assembly; queued messages are packed here until the MTU is reached
    wip: Vec<u8>,

    assembler: FragmentAssembler,
    next_fragment_group: u32,

    disconnect_reason: String,
    notify_remote_on_close: bool,

    stats: ConnectionStatistics,
}

impl Connection {
    fn new(
        remote_addr: SocketAddr,
        config: Arc<PeerConfig>,
        local_peer_id: u64,
        nonce: u32,
        is_initiator: bool,
        now: Instant,
    ) -> Connection {
        let handshake_resend_delay = config.resend_handshake_interval;
        let timeout = config.connection_timeout;
        let mtu = config.maximum_transmission_unit;
        Connection {
            id: ConnectionId(remote_addr),
            remote_addr,
            status: ConnectionStatus::None,
            is_initiator,
            local_peer_id,
            remote_peer_id: None,
            nonce,
            sender_channels: FxHashMap::default(),
            receiver_channels: FxHashMap::default(),
            pending_acks: Vec::new(),
            last_ack_sent: now,
            avg_rtt: None,
            resend_delay: Duration::from_millis(510),
            last_heard: now,
            timeout_deadline: now + timeout,
            last_ping_sent: None,
            ping_number: 0,
            ping_sent_at: now,
            current_mtu: mtu,
            mtu_probe: None,
            handshake_attempts: 0,
            last_handshake_sent: now,
            handshake_resend_delay,
            wip: Vec::with_capacity(config.send_buffer_size.min(2048)),
            assembler: FragmentAssembler::new(config.max_fragment_groups),
            next_fragment_group: 0,
            disconnect_reason: String::new(),
            notify_remote_on_close: false,
            config,
            stats: ConnectionStatistics::default(),
        }
    }

    pub fn new_outgoing(
        remote_addr: SocketAddr,
        config: Arc<PeerConfig>,
        local_peer_id: u64,
        nonce: u32,
        now: Instant,
    ) -> Connection {
        Connection::new(remote_addr, config, local_peer_id, nonce, true, now)
    }

    pub fn new_incoming(
        remote_addr: SocketAddr,
        config: Arc<PeerConfig>,
        local_peer_id: u64,
        connect: &ConnectPayload,
        now: Instant,
    ) -> Connection {
        let mut conn = Connection::new(remote_addr, config, local_peer_id, connect.nonce, false, now);
        conn.status = ConnectionStatus::ReceivedInitiation;
        conn.remote_peer_id = Some(connect.peer_id);
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn statistics(&self) -> &ConnectionStatistics {
        &self.stats
    }

    pub fn current_mtu(&self) -> usize {
        self.current_mtu
    }

    /// Smoothed round trip time, once at least one sample exists.
    pub fn average_rtt(&self) -> Option<Duration> {
        self.avg_rtt.map(Duration::from_secs_f32)
    }

    /// The handshake counterpart answered from a different port (typical NAT rebind):
    ///  keep the connection, follow the endpoint.
    pub fn rekey(&mut self, new_addr: SocketAddr) {
        debug!("re-keying connection {:?} to {:?}", self.id, new_addr);
        self.remote_addr = new_addr;
    }

    pub fn note_datagram_received(&mut self, len: usize) {
        self.stats.received_datagrams += 1;
        self.stats.received_bytes += len as u64;
    }

    // ---- handshake ------------------------------------------------------------------------

    /// Transmit (or retransmit) our side of the handshake.
    pub async fn send_handshake(&mut self, pipeline: &SendPipeline, now: Instant) {
        let msg_type;
        let mut w = BitWriter::new();
        if self.is_initiator {
            msg_type = MessageType::Connect;
            ConnectPayload {
                app_identifier: self.config.app_identifier.clone(),
                app_version: self.config.app_version,
                peer_id: self.local_peer_id,
                nonce: self.nonce,
            }
            .ser(&mut w);
            if self.status == ConnectionStatus::None {
                self.status = ConnectionStatus::InitiatedConnect;
            }
        } else {
            msg_type = MessageType::ConnectResponse;
            ConnectResponsePayload {
                app_identifier: self.config.app_identifier.clone(),
                app_version: self.config.app_version,
                peer_id: self.local_peer_id,
                nonce: self.nonce,
            }
            .ser(&mut w);
        }

        self.handshake_attempts += 1;
        self.last_handshake_sent = now;
        let _ = self.send_library(pipeline, msg_type, &w).await;
    }

    /// Surface the pending Connect to the application for an approve/deny decision.
    pub fn set_awaiting_approval(&mut self, now: Instant, released: &mut Vec<IncomingMessage>) {
        debug_assert_eq!(self.status, ConnectionStatus::ReceivedInitiation);
        self.status = ConnectionStatus::RespondedAwaitingApproval;

        let mut msg = IncomingMessage::new(IncomingKind::ConnectionApproval, Vec::new(), 0, now);
        msg.connection = Some(self.id);
        msg.sender_addr = Some(self.remote_addr);
        released.push(msg);
    }

    /// Accept a pending incoming connection and answer its Connect.
    pub async fn approve(&mut self, pipeline: &SendPipeline, now: Instant) {
        debug_assert!(matches!(
            self.status,
            ConnectionStatus::ReceivedInitiation | ConnectionStatus::RespondedAwaitingApproval
        ));
        self.status = ConnectionStatus::RespondedConnect;
        self.handshake_attempts = 0;
        self.handshake_resend_delay = self.config.resend_handshake_interval;
        self.send_handshake(pipeline, now).await;
    }

    /// Reject a pending incoming connection with a reason.
    pub async fn deny(
        &mut self,
        pipeline: &SendPipeline,
        reason: &str,
        now: Instant,
        released: &mut Vec<IncomingMessage>,
    ) {
        let mut w = BitWriter::new();
        DisconnectPayload {
            reason: reason.to_string(),
        }
        .ser(&mut w);
        let _ = self.send_library(pipeline, MessageType::Disconnect, &w).await;
        self.set_status(ConnectionStatus::Disconnected, reason, now, released);
    }

    /// Begin a local, orderly disconnect; completed by the next heartbeat.
    pub fn disconnect(&mut self, reason: &str, now: Instant, released: &mut Vec<IncomingMessage>) {
        match self.status {
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => {}
            _ => {
                self.disconnect_reason = reason.to_string();
                self.notify_remote_on_close = true;
                self.set_status(ConnectionStatus::Disconnecting, reason, now, released);
            }
        }
    }

    fn set_status(
        &mut self,
        status: ConnectionStatus,
        reason: &str,
        now: Instant,
        released: &mut Vec<IncomingMessage>,
    ) {
        if self.status == status {
            return;
        }
        debug!(
            "connection {:?}: {:?} -> {:?} ({})",
            self.id, self.status, status, reason
        );
        self.status = status;

        let mut msg = IncomingMessage::new(
            IncomingKind::StatusChanged {
                status,
                reason: reason.to_string(),
            },
            Vec::new(),
            0,
            now,
        );
        msg.connection = Some(self.id);
        msg.sender_addr = Some(self.remote_addr);
        released.push(msg);
    }

    fn on_connected(&mut self, reason: &str, now: Instant, released: &mut Vec<IncomingMessage>) {
        self.set_status(ConnectionStatus::Connected, reason, now, released);
        self.timeout_deadline = now + self.config.connection_timeout;

        // make the next heartbeat ping right away for an early RTT sample
        self.last_ping_sent = None;

        if self.config.auto_expand_mtu && self.config.expand_mtu_ceiling > self.current_mtu {
            self.mtu_probe = Some(MtuProbe::new(self.current_mtu, self.config.expand_mtu_ceiling));
        }
    }

    // ---- outgoing user messages ----------------------------------------------------------

    /// Enqueue a user payload on the matching sender channel, fragmenting when it does not
    ///  fit a single datagram.
    pub fn enqueue_outgoing(
        &mut self,
        method: DeliveryMethod,
        channel: u8,
        data: Vec<u8>,
        bit_len: usize,
    ) {
        let channel = channel % method.channel_count();

        if data.len() + MessageHeader::SERIALIZED_LEN > self.current_mtu {
            let group = self.next_fragment_group;
            self.next_fragment_group = self.next_fragment_group.wrapping_add(1);
            let chunk_size = best_chunk_size(self.current_mtu);

            trace!(
                "fragmenting {} byte payload into group {} with chunk size {}",
                data.len(),
                group,
                chunk_size
            );
            let msg_type = MessageType::User(DeliveryMethod::ReliableOrdered, FRAGMENT_CHANNEL);
            let sender = self
                .sender_channels
                .entry(msg_type.tag())
                .or_insert_with(|| SenderChannel::new_for(msg_type));
            for chunk in split_payload(group, &data, bit_len, chunk_size) {
                sender.enqueue(chunk);
            }
            return;
        }

        let msg_type = MessageType::User(method, channel);
        self.sender_channels
            .entry(msg_type.tag())
            .or_insert_with(|| SenderChannel::new_for(msg_type))
            .enqueue(WirePayload::new(data, bit_len));
    }

    // ---- heartbeat ------------------------------------------------------------------------

    pub async fn heartbeat(
        &mut self,
        now: Instant,
        pipeline: &SendPipeline,
        released: &mut Vec<IncomingMessage>,
    ) {
        match self.status {
            ConnectionStatus::None | ConnectionStatus::Disconnected => {}

            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                self.handshake_heartbeat(now, pipeline, released).await;
            }

            ConnectionStatus::ReceivedInitiation | ConnectionStatus::RespondedAwaitingApproval => {
                if now >= self.timeout_deadline {
                    self.set_status(ConnectionStatus::Disconnected, "timeout", now, released);
                }
            }

            ConnectionStatus::Connected => {
                self.ping_heartbeat(now, pipeline).await;

                if now >= self.timeout_deadline {
                    self.disconnect_reason = "timeout".to_string();
                    self.notify_remote_on_close = true;
                    self.set_status(ConnectionStatus::Disconnecting, "timeout", now, released);
                    return;
                }

                self.mtu_heartbeat(now, pipeline).await;

                if self.config.auto_flush_send_queue {
                    self.flush_channels(now, pipeline).await;
                }
                self.drain_acks(now, pipeline).await;
                self.flush_wip(pipeline).await;
            }

            ConnectionStatus::Disconnecting => {
                // flush what we can, tell the remote, and settle
                self.flush_channels(now, pipeline).await;
                self.flush_wip(pipeline).await;

                if self.notify_remote_on_close {
                    let mut w = BitWriter::new();
                    DisconnectPayload {
                        reason: self.disconnect_reason.clone(),
                    }
                    .ser(&mut w);
                    let _ = self.send_library(pipeline, MessageType::Disconnect, &w).await;
                }
                let reason = self.disconnect_reason.clone();
                self.set_status(ConnectionStatus::Disconnected, &reason, now, released);
            }
        }
    }

    async fn handshake_heartbeat(
        &mut self,
        now: Instant,
        pipeline: &SendPipeline,
        released: &mut Vec<IncomingMessage>,
    ) {
        if now.duration_since(self.last_handshake_sent) < self.handshake_resend_delay {
            return;
        }

        if self.handshake_attempts >= self.config.maximum_handshake_attempts {
            debug!(
                "connection {:?}: handshake given up after {} attempts",
                self.id, self.handshake_attempts
            );
            self.set_status(ConnectionStatus::Disconnected, "timeout", now, released);
            return;
        }

        self.handshake_resend_delay *= 2;
        self.send_handshake(pipeline, now).await;
    }

    async fn ping_heartbeat(&mut self, now: Instant, pipeline: &SendPipeline) {
        if let Some(last) = self.last_ping_sent {
            if now.duration_since(last) < self.config.ping_interval {
                return;
            }
        }

        self.ping_number = self.ping_number.wrapping_add(1);
        self.last_ping_sent = Some(now);
        self.ping_sent_at = now;

        let mut w = BitWriter::new();
        PingPayload {
            ping_number: self.ping_number,
        }
        .ser(&mut w);
        let _ = self.send_library(pipeline, MessageType::Ping, &w).await;
    }

    async fn mtu_heartbeat(&mut self, now: Instant, pipeline: &SendPipeline) {
        let Some(probe) = &mut self.mtu_probe else {
            return;
        };

        if let Some(last) = probe.last_sent {
            if now.duration_since(last) < self.config.expand_mtu_frequency {
                return;
            }
        }

        if probe.attempts_at_candidate >= self.config.expand_mtu_fail_attempts {
            // unanswered often enough: the candidate size does not pass
            probe.high = probe.candidate - 1;
            probe.attempts_at_candidate = 0;
            if probe.low >= probe.high {
                debug!(
                    "connection {:?}: MTU probing settled at {}",
                    self.id, probe.low
                );
                self.current_mtu = probe.low;
                self.mtu_probe = None;
                return;
            }
            probe.candidate = (probe.low + probe.high + 1) / 2;
        }

        let candidate = probe.candidate;
        probe.attempts_at_candidate += 1;
        probe.last_sent = Some(now);

        // build a request padded so the datagram is exactly `candidate` bytes on the wire
        let mut w = BitWriter::with_capacity(candidate);
        ExpandMtuPayload {
            size: candidate as u32,
        }
        .ser(&mut w);
        let padding = candidate - MessageHeader::SERIALIZED_LEN - w.byte_len();
        w.write_bytes(&vec![0u8; padding]);

        trace!("connection {:?}: probing MTU {}", self.id, candidate);
        if self
            .send_library(pipeline, MessageType::ExpandMtuRequest, &w)
            .await
            .is_err()
        {
            // the local stack refused the datagram - treat like a failed probe right away
            if let Some(probe) = &mut self.mtu_probe {
                probe.attempts_at_candidate = self.config.expand_mtu_fail_attempts;
            }
        }
    }

    async fn flush_channels(&mut self, now: Instant, pipeline: &SendPipeline) {
        let mut items = Vec::new();
        let resend_delay = self.resend_delay;
        for channel in self.sender_channels.values_mut() {
            self.stats.resent_messages += channel.send_queued(now, resend_delay, &mut items);
        }
        for item in items {
            self.queue_item(pipeline, item).await;
        }
    }

    /// Force out everything queued regardless of the auto-flush setting.
    pub async fn flush_send_queue(&mut self, now: Instant, pipeline: &SendPipeline) {
        if self.status == ConnectionStatus::Connected {
            self.flush_channels(now, pipeline).await;
            self.flush_wip(pipeline).await;
        }
    }

    async fn drain_acks(&mut self, now: Instant, pipeline: &SendPipeline) {
        if self.pending_acks.is_empty() {
            return;
        }
        // batch acks instead of answering every datagram individually
        if now.duration_since(self.last_ack_sent) < self.resend_delay / 3 {
            return;
        }
        self.last_ack_sent = now;

        let pairs_per_message =
            (self.current_mtu - MessageHeader::SERIALIZED_LEN) / 3;
        let pending = std::mem::take(&mut self.pending_acks);

        for chunk in pending.chunks(pairs_per_message.max(1)) {
            let mut data = Vec::with_capacity(chunk.len() * 3);
            for &(tag, seq) in chunk {
                data.push(tag);
                data.extend_from_slice(&seq.to_raw().to_le_bytes());
            }
            let bit_len = data.len() * 8;
            self.queue_item(
                pipeline,
                SendItem {
                    msg_type: MessageType::Acknowledge,
                    sequence: SeqNr::ZERO,
                    payload: WirePayload::new(data, bit_len),
                },
            )
            .await;
        }
    }

    // ---- datagram assembly ----------------------------------------------------------------

    async fn queue_item(&mut self, pipeline: &SendPipeline, item: SendItem) {
        let needed = MessageHeader::SERIALIZED_LEN + item.payload.byte_len();
        if !self.wip.is_empty() && self.wip.len() + needed > self.current_mtu {
            self.flush_wip(pipeline).await;
        }

        MessageHeader {
            msg_type_tag: item.msg_type.tag(),
            is_fragment: item.payload.is_fragment,
            sequence: item.sequence,
            payload_bits: item.payload.bit_len as u16,
        }
        .ser(&mut self.wip);
        self.wip.extend_from_slice(&item.payload.data);
        self.stats.sent_messages += 1;
    }

    pub async fn flush_wip(&mut self, pipeline: &SendPipeline) {
        if self.wip.is_empty() {
            return;
        }

        match pipeline.send_datagram(self.remote_addr, &self.wip).await {
            Ok(()) => {
                self.stats.sent_datagrams += 1;
                self.stats.sent_bytes += self.wip.len() as u64;
            }
            Err(e) => {
                // reliable payloads stay stored and will be retransmitted; there is nothing
                //  useful to do here beyond making the condition visible
                warn!("send to {:?} failed: {}", self.remote_addr, e);
            }
        }
        self.wip.clear();
    }

    async fn send_library(
        &mut self,
        pipeline: &SendPipeline,
        msg_type: MessageType,
        payload: &BitWriter,
    ) -> std::io::Result<()> {
        let mut datagram =
            Vec::with_capacity(MessageHeader::SERIALIZED_LEN + payload.byte_len());
        MessageHeader {
            msg_type_tag: msg_type.tag(),
            is_fragment: false,
            sequence: SeqNr::ZERO,
            payload_bits: payload.bit_len() as u16,
        }
        .ser(&mut datagram);
        datagram.extend_from_slice(payload.as_bytes());

        let result = pipeline.send_datagram(self.remote_addr, &datagram).await;
        if result.is_ok() {
            self.stats.sent_datagrams += 1;
            self.stats.sent_bytes += datagram.len() as u64;
            self.stats.sent_messages += 1;
        }
        result
    }

    // ---- incoming -------------------------------------------------------------------------

    pub async fn handle_message(
        &mut self,
        header: MessageHeader,
        payload: &[u8],
        now: Instant,
        pipeline: &SendPipeline,
        pool: &MessagePool,
        released: &mut Vec<IncomingMessage>,
    ) {
        self.last_heard = now;
        self.timeout_deadline = now + self.config.connection_timeout;
        self.stats.received_messages += 1;

        match MessageType::from_tag(header.msg_type_tag) {
            None => {
                warn!(
                    "connection {:?}: unknown message type {} - skipping",
                    self.id, header.msg_type_tag
                );
            }
            Some(MessageType::User(delivery, channel)) => {
                self.handle_user(header, payload, delivery, channel, now, pool, released);
            }
            Some(MessageType::UnconnectedData) => {
                let mut data = pool.get_buffer(payload.len());
                data.extend_from_slice(payload);
                let mut msg = IncomingMessage::new(
                    IncomingKind::UnconnectedData,
                    data,
                    header.payload_bits as usize,
                    now,
                );
                msg.sender_addr = Some(self.remote_addr);
                released.push(msg);
            }
            Some(library) => {
                self.handle_library(library, header, payload, now, pipeline, released)
                    .await;
            }
        }
    }

    fn handle_user(
        &mut self,
        header: MessageHeader,
        payload: &[u8],
        delivery: DeliveryMethod,
        channel: u8,
        now: Instant,
        pool: &MessagePool,
        released: &mut Vec<IncomingMessage>,
    ) {
        if self.status != ConnectionStatus::Connected {
            trace!(
                "connection {:?}: dropping user message in status {:?}",
                self.id,
                self.status
            );
            return;
        }

        let msg_type = MessageType::User(delivery, channel);
        let mut data = pool.get_buffer(payload.len());
        data.extend_from_slice(payload);

        let mut msg =
            IncomingMessage::new(IncomingKind::Data, data, header.payload_bits as usize, now);
        msg.sender_addr = Some(self.remote_addr);
        msg.connection = Some(self.id);
        msg.delivery = Some((delivery, channel));
        msg.is_fragment = header.is_fragment;

        let mut channel_released = Vec::new();
        let dropped = self
            .receiver_channels
            .entry(msg_type.tag())
            .or_insert_with(|| ReceiverChannel::new_for(msg_type))
            .receive(header.sequence, msg, &mut self.pending_acks, &mut channel_released);
        if dropped {
            self.stats.dropped_messages += 1;
        }

        for msg in channel_released {
            if msg.is_fragment {
                self.handle_fragment_chunk(msg, pool, released);
            } else {
                released.push(msg);
            }
        }
    }

    fn handle_fragment_chunk(
        &mut self,
        msg: IncomingMessage,
        pool: &MessagePool,
        released: &mut Vec<IncomingMessage>,
    ) {
        let mut buf: &[u8] = &msg.data;
        let header = match FragmentHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("connection {:?}: dropping fragment chunk: {}", self.id, e);
                self.stats.dropped_messages += 1;
                return;
            }
        };

        match self.assembler.on_chunk(&header, buf) {
            Ok(Some((data, bit_len))) => {
                trace!(
                    "connection {:?}: fragment group {} complete ({} bits)",
                    self.id,
                    header.group,
                    bit_len
                );
                let mut complete = IncomingMessage::new(
                    IncomingKind::Data,
                    data,
                    bit_len,
                    msg.receive_time,
                );
                complete.sender_addr = msg.sender_addr;
                complete.connection = msg.connection;
                complete.delivery = msg.delivery;
                released.push(complete);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("connection {:?}: dropping fragment chunk: {}", self.id, e);
                self.stats.dropped_messages += 1;
            }
        }
        pool.return_buffer(msg.into_payload_buffer());
    }

    async fn handle_library(
        &mut self,
        msg_type: MessageType,
        header: MessageHeader,
        payload: &[u8],
        now: Instant,
        pipeline: &SendPipeline,
        released: &mut Vec<IncomingMessage>,
    ) {
        let mut reader = BitReader::new(payload, header.payload_bits as usize);

        match msg_type {
            MessageType::Ping => {
                if let Ok(ping) = PingPayload::deser(&mut reader) {
                    let mut w = BitWriter::new();
                    ping.ser(&mut w);
                    let _ = self.send_library(pipeline, MessageType::Pong, &w).await;
                }
            }
            MessageType::Pong => {
                if let Ok(pong) = PingPayload::deser(&mut reader) {
                    if pong.ping_number == self.ping_number {
                        let sample = now.duration_since(self.ping_sent_at).as_secs_f32();
                        self.update_rtt(sample);
                    }
                }
            }
            MessageType::Acknowledge => {
                self.handle_acks(payload, header.payload_bits, now, pipeline)
                    .await;
            }
            MessageType::Connect => {
                // our ConnectResponse was lost; repeat it
                if !self.is_initiator
                    && matches!(
                        self.status,
                        ConnectionStatus::RespondedConnect | ConnectionStatus::Connected
                    )
                {
                    self.send_handshake(pipeline, now).await;
                }
            }
            MessageType::ConnectResponse => {
                self.handle_connect_response(&mut reader, now, pipeline, released)
                    .await;
            }
            MessageType::ConnectionEstablished => {
                if self.status == ConnectionStatus::RespondedConnect {
                    let sample = now.duration_since(self.last_handshake_sent).as_secs_f32();
                    self.update_rtt(sample);
                    self.on_connected("connection established", now, released);
                }
            }
            MessageType::Disconnect => {
                let reason = DisconnectPayload::deser(&mut reader)
                    .map(|p| p.reason)
                    .unwrap_or_else(|_| "disconnected".to_string());
                self.set_status(ConnectionStatus::Disconnected, &reason, now, released);
            }
            MessageType::ExpandMtuRequest => {
                if let Ok(probe) = ExpandMtuPayload::deser(&mut reader) {
                    // receiving it proves the size passes; confirm it
                    let mut w = BitWriter::new();
                    probe.ser(&mut w);
                    let _ = self
                        .send_library(pipeline, MessageType::ExpandMtuSuccess, &w)
                        .await;
                }
            }
            MessageType::ExpandMtuSuccess => {
                if let Ok(success) = ExpandMtuPayload::deser(&mut reader) {
                    self.handle_mtu_success(success.size as usize);
                }
            }
            _ => {
                warn!(
                    "connection {:?}: unexpected library message {:?}",
                    self.id, msg_type
                );
            }
        }
    }

    async fn handle_connect_response(
        &mut self,
        reader: &mut BitReader<'_>,
        now: Instant,
        pipeline: &SendPipeline,
        released: &mut Vec<IncomingMessage>,
    ) {
        let Ok(response) = ConnectResponsePayload::deser(reader) else {
            warn!("connection {:?}: malformed ConnectResponse", self.id);
            return;
        };

        match self.status {
            ConnectionStatus::InitiatedConnect => {
                if response.nonce != self.nonce {
                    debug!(
                        "connection {:?}: ConnectResponse with stale nonce - ignoring",
                        self.id
                    );
                    return;
                }
                if response.app_identifier != self.config.app_identifier {
                    self.deny(pipeline, "wrong application identifier", now, released)
                        .await;
                    return;
                }
                if response.app_version != self.config.app_version {
                    self.deny(pipeline, "wrong application version", now, released)
                        .await;
                    return;
                }

                self.remote_peer_id = Some(response.peer_id);
                let sample = now.duration_since(self.last_handshake_sent).as_secs_f32();
                self.update_rtt(sample);

                let w = BitWriter::new();
                let _ = self
                    .send_library(pipeline, MessageType::ConnectionEstablished, &w)
                    .await;
                self.on_connected("connected", now, released);
            }
            ConnectionStatus::Connected if self.is_initiator => {
                // the remote missed our ConnectionEstablished; repeat it
                let w = BitWriter::new();
                let _ = self
                    .send_library(pipeline, MessageType::ConnectionEstablished, &w)
                    .await;
            }
            _ => {
                trace!(
                    "connection {:?}: ignoring ConnectResponse in status {:?}",
                    self.id,
                    self.status
                );
            }
        }
    }

    async fn handle_acks(
        &mut self,
        payload: &[u8],
        payload_bits: u16,
        now: Instant,
        pipeline: &SendPipeline,
    ) {
        let pair_count = (payload_bits as usize / 8) / 3;
        let mut items = Vec::new();
        let mut good_sample = false;

        for pair in payload.chunks_exact(3).take(pair_count) {
            let tag = pair[0];
            let seq = SeqNr::from_raw(u16::from_le_bytes([pair[1], pair[2]]));

            let Some(channel) = self.sender_channels.get_mut(&tag) else {
                trace!("ack for unknown channel tag {} - ignoring", tag);
                continue;
            };
            let result = channel.receive_ack(now, seq, self.resend_delay, &mut items);
            good_sample |= result.good_rtt_sample;
            self.stats.resent_messages += result.resent;
        }

        if good_sample {
            // a promptly acked first transmission is as good a liveness proof as a pong
            self.timeout_deadline = now + self.config.connection_timeout;
        }

        for item in items {
            self.queue_item(pipeline, item).await;
        }
    }

    fn handle_mtu_success(&mut self, size: usize) {
        if size > self.current_mtu {
            debug!("connection {:?}: MTU raised to {}", self.id, size);
            self.current_mtu = size;
        }

        if let Some(probe) = &mut self.mtu_probe {
            probe.low = probe.low.max(size);
            probe.attempts_at_candidate = 0;
            if probe.low >= probe.high {
                self.current_mtu = self.current_mtu.max(probe.low);
                self.mtu_probe = None;
            } else {
                probe.candidate = (probe.low + probe.high + 1) / 2;
            }
        }
    }

    fn update_rtt(&mut self, sample: f32) {
        let avg = match self.avg_rtt {
            Some(avg) => avg * 0.7 + sample * 0.3,
            None => sample,
        };
        self.avg_rtt = Some(avg);
        self.resend_delay =
            Duration::from_secs_f32(2.0 * avg + 0.01).max(MIN_RESEND_DELAY);
        trace!(
            "connection {:?}: rtt sample {:.1} ms, avg {:.1} ms, resend delay {:?}",
            self.id,
            sample * 1000.0,
            avg * 1000.0,
            self.resend_delay
        );
    }
}
