//! The peer: one UDP endpoint, a set of connections keyed by remote address, and the single
//!  network worker task that owns all of it.
//!
//! Application code holds a [Peer] handle and talks to the worker exclusively through
//!  queues: commands go in, released [IncomingMessage]s come out. The worker is the only
//!  place that reads the socket or mutates connection state, so none of the protocol
//!  machinery needs locks.

use crate::bit_buffer::{BitReader, BitWriter};
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::control_messages::{ConnectPayload, DisconnectPayload, NatIntroductionPayload, NatPunchPayload};
use crate::message::{
    ConnectionId, DeliveryMethod, IncomingKind, IncomingMessage, MessageType, OutgoingMessage,
};
use crate::message_header::MessageHeader;
use crate::message_pool::MessagePool;
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::seq::SeqNr;
use crate::statistics::PeerStatistics;
use anyhow::{anyhow, bail};
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

enum Command {
    Connect {
        addr: SocketAddr,
    },
    Disconnect {
        conn: ConnectionId,
        reason: String,
    },
    Send {
        conn: ConnectionId,
        method: DeliveryMethod,
        channel: u8,
        data: Vec<u8>,
        bit_len: usize,
    },
    SendUnconnected {
        addr: SocketAddr,
        data: Vec<u8>,
        bit_len: usize,
    },
    Approve {
        conn: ConnectionId,
    },
    Deny {
        conn: ConnectionId,
        reason: String,
    },
    Discover {
        addr: SocketAddr,
    },
    DiscoverLocal {
        port: u16,
    },
    SendDiscoveryResponse {
        addr: SocketAddr,
        data: Vec<u8>,
        bit_len: usize,
    },
    NatIntroduce {
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: String,
    },
    FlushSendQueue,
    Shutdown {
        reason: String,
    },
}

/// A messaging endpoint bound to one UDP socket.
pub struct Peer {
    command_tx: mpsc::UnboundedSender<Command>,
    released_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingMessage>>,
    local_addr: SocketAddr,
    peer_id: u64,
    default_message_capacity: usize,
    pool: Arc<MessagePool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Bind the socket and spawn the network worker. A bind failure is returned to the
    ///  caller and nothing is spawned.
    pub async fn start(config: PeerConfig) -> anyhow::Result<Peer> {
        config.validate()?;
        let config = Arc::new(config);

        let bind_addr = if config.dual_stack && config.local_address == IpAddr::from([0, 0, 0, 0])
        {
            IpAddr::from(std::net::Ipv6Addr::UNSPECIFIED)
        } else {
            config.local_address
        };
        let socket = UdpSocket::bind((bind_addr, config.port)).await?;
        let local_addr = socket.local_addr()?;
        info!("peer bound to {:?}", local_addr);
        let socket = Arc::new(socket);

        let peer_id = derive_peer_id(local_addr);
        let default_message_capacity = config.default_outgoing_message_capacity;
        let pool = Arc::new(MessagePool::new(256));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (released_tx, released_rx) = mpsc::unbounded_channel();

        let pipeline = SendPipeline::new(
            Arc::new(socket.clone()) as Arc<dyn SendSocket>,
            config.simulation.clone(),
        );

        let worker = Worker {
            socket,
            pipeline,
            config,
            peer_id,
            connections: FxHashMap::default(),
            handshakes: FxHashMap::default(),
            command_rx,
            released_tx,
            pool: pool.clone(),
            unconnected_queue: VecDeque::new(),
            released: Vec::new(),
            stats: PeerStatistics::default(),
            last_heartbeat: Instant::now(),
        };
        let handle = tokio::spawn(worker.run());

        Ok(Peer {
            command_tx,
            released_rx: tokio::sync::Mutex::new(released_rx),
            local_addr,
            peer_id,
            default_message_capacity,
            pool,
            worker: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// A fresh outgoing message sized to the configured default capacity.
    pub fn create_message(&self) -> OutgoingMessage {
        OutgoingMessage::with_capacity(self.default_message_capacity)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This peer's 64-bit identity as reported in handshakes.
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    /// Begin connecting to a remote peer. The returned handle is valid immediately; progress
    ///  is reported through StatusChanged messages.
    pub fn connect(&self, addr: SocketAddr) -> anyhow::Result<ConnectionId> {
        self.command(Command::Connect { addr })?;
        Ok(ConnectionId(addr))
    }

    /// Resolve `host` and connect to the first address found.
    pub async fn connect_host(&self, host: &str, port: u16) -> anyhow::Result<ConnectionId> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("host not found: {}", host))?;
        self.connect(addr)
    }

    pub fn disconnect(&self, conn: ConnectionId, reason: &str) -> anyhow::Result<()> {
        self.command(Command::Disconnect {
            conn,
            reason: reason.to_string(),
        })
    }

    /// Queue a message on one of the connection's channels. Submission order on a channel is
    ///  its delivery order guarantee (per the chosen method).
    pub fn send_message(
        &self,
        conn: ConnectionId,
        message: OutgoingMessage,
        method: DeliveryMethod,
        channel: u8,
    ) -> anyhow::Result<()> {
        if channel >= method.channel_count() {
            bail!(
                "channel {} out of range for {:?} ({} channels)",
                channel,
                method,
                method.channel_count()
            );
        }
        let (data, bit_len) = message.into_parts();
        self.command(Command::Send {
            conn,
            method,
            channel,
            data,
            bit_len,
        })
    }

    /// Send a connectionless message; transmitted on the worker's next heartbeat.
    pub fn send_unconnected(&self, addr: SocketAddr, message: OutgoingMessage) -> anyhow::Result<()> {
        let (data, bit_len) = message.into_parts();
        self.command(Command::SendUnconnected { addr, data, bit_len })
    }

    /// Accept a connection surfaced as [IncomingKind::ConnectionApproval].
    pub fn approve(&self, conn: ConnectionId) -> anyhow::Result<()> {
        self.command(Command::Approve { conn })
    }

    /// Reject a connection surfaced as [IncomingKind::ConnectionApproval].
    pub fn deny(&self, conn: ConnectionId, reason: &str) -> anyhow::Result<()> {
        self.command(Command::Deny {
            conn,
            reason: reason.to_string(),
        })
    }

    /// Send a discovery request to a specific endpoint.
    pub fn discover(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.command(Command::Discover { addr })
    }

    /// Broadcast a discovery request on the local network.
    pub fn discover_local(&self, port: u16) -> anyhow::Result<()> {
        self.command(Command::DiscoverLocal { port })
    }

    /// Answer a received [IncomingKind::DiscoveryRequest].
    pub fn send_discovery_response(
        &self,
        addr: SocketAddr,
        message: OutgoingMessage,
    ) -> anyhow::Result<()> {
        let (data, bit_len) = message.into_parts();
        self.command(Command::SendDiscoveryResponse { addr, data, bit_len })
    }

    /// Introduce two peers to each other for NAT punch-through. Both get told the other's
    ///  endpoints and start punching; the first punch that arrives is surfaced as
    ///  [IncomingKind::NatIntroductionSuccess].
    pub fn nat_introduce(
        &self,
        host: (SocketAddr, SocketAddr),
        client: (SocketAddr, SocketAddr),
        token: &str,
    ) -> anyhow::Result<()> {
        self.command(Command::NatIntroduce {
            host_internal: host.0,
            host_external: host.1,
            client_internal: client.0,
            client_external: client.1,
            token: token.to_string(),
        })
    }

    /// Push queued messages out now instead of waiting for the next heartbeat.
    pub fn flush_send_queue(&self) -> anyhow::Result<()> {
        self.command(Command::FlushSendQueue)
    }

    /// Wait for the next released message. Returns `None` once the peer is shut down and the
    ///  queue is drained.
    pub async fn read_message(&self) -> Option<IncomingMessage> {
        self.released_rx.lock().await.recv().await
    }

    /// Like [Peer::read_message], bounded by `timeout`.
    pub async fn read_message_timeout(&self, timeout: Duration) -> Option<IncomingMessage> {
        tokio::time::timeout(timeout, self.read_message())
            .await
            .ok()
            .flatten()
    }

    /// Non-blocking poll of the released-message queue.
    pub fn try_read_message(&self) -> Option<IncomingMessage> {
        self.released_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Return a drained message's buffer to the pool.
    pub fn recycle(&self, message: IncomingMessage) {
        self.pool.return_buffer(message.into_payload_buffer());
    }

    /// Disconnect everything with `reason`, flush the goodbyes, and stop the worker.
    pub async fn shutdown(&self, reason: &str) {
        let _ = self.command_tx.send(Command::Shutdown {
            reason: reason.to_string(),
        });
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn command(&self, command: Command) -> anyhow::Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| anyhow!("peer is shut down"))
    }
}

/// A 64-bit identity from the bound endpoint and process-local randomness.
fn derive_peer_id(local_addr: SocketAddr) -> u64 {
    let mut hasher = FxHasher::default();
    local_addr.hash(&mut hasher);
    hasher.finish() ^ rand::random::<u64>()
}

enum Wake {
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Command(Option<Command>),
    Heartbeat,
}

/// The network worker: sole owner of the socket's receive half and all connection state.
struct Worker {
    socket: Arc<UdpSocket>,
    pipeline: SendPipeline,
    config: Arc<PeerConfig>,
    peer_id: u64,

    connections: FxHashMap<SocketAddr, Connection>,
    /// pending handshakes, promoted into `connections` once Connected
    handshakes: FxHashMap<SocketAddr, Connection>,

    command_rx: mpsc::UnboundedReceiver<Command>,
    released_tx: mpsc::UnboundedSender<IncomingMessage>,
    pool: Arc<MessagePool>,

    unconnected_queue: VecDeque<(SocketAddr, Vec<u8>, usize)>,

    /// scratch list of messages to release at the end of the current step
    released: Vec<IncomingMessage>,
    stats: PeerStatistics,
    last_heartbeat: Instant,
}

impl Worker {
    async fn run(mut self) {
        info!("network worker started");
        let socket = self.socket.clone();
        let mut recv_buf = vec![0u8; self.config.receive_buffer_size];

        loop {
            let heartbeat_at = self.last_heartbeat + self.heartbeat_period();

            let wake = tokio::select! {
                result = socket.recv_from(&mut recv_buf) => Wake::Datagram(result),
                command = self.command_rx.recv() => Wake::Command(command),
                _ = tokio::time::sleep_until(heartbeat_at) => Wake::Heartbeat,
            };

            let now = Instant::now();
            match wake {
                Wake::Datagram(Ok((len, from))) => {
                    self.handle_datagram(now, from, &recv_buf[..len]).await;
                }
                Wake::Datagram(Err(e)) => {
                    // ConnectionReset here is the OS relaying an ICMP port-unreachable for
                    //  an earlier send without telling us which one; the implicated
                    //  connection will run into its timeout if the remote is really gone
                    warn!("socket receive error: {}", e);
                }
                Wake::Command(Some(command)) => {
                    if !self.handle_command(command, now).await {
                        break;
                    }
                }
                Wake::Command(None) => {
                    // every Peer handle is gone
                    self.shutdown("peer dropped", now).await;
                    break;
                }
                Wake::Heartbeat => {
                    self.heartbeat(now).await;
                    self.last_heartbeat = now;
                }
            }

            self.sweep();
            self.flush_released();
        }
        debug!("network worker stopped; {}", self.stats);
    }

    /// Heartbeat rate per §: at least 250/s, scaling down from 1250/s as connections grow.
    fn heartbeat_period(&self) -> Duration {
        let per_second = 250.max(1250usize.saturating_sub(self.connections.len())) as f64;
        Duration::from_secs_f64(1.0 / per_second)
    }

    async fn heartbeat(&mut self, now: Instant) {
        while let Some((addr, data, bit_len)) = self.unconnected_queue.pop_front() {
            self.send_standalone(addr, MessageType::UnconnectedData, &data, bit_len)
                .await;
        }

        let mut released = std::mem::take(&mut self.released);
        for conn in self.connections.values_mut() {
            conn.heartbeat(now, &self.pipeline, &mut released).await;
        }
        for conn in self.handshakes.values_mut() {
            conn.heartbeat(now, &self.pipeline, &mut released).await;
        }
        self.released = released;
    }

    // ---- receive path ---------------------------------------------------------------------

    async fn handle_datagram(&mut self, now: Instant, from: SocketAddr, data: &[u8]) {
        trace!("received {} bytes from {:?}", data.len(), from);
        self.stats.received_datagrams += 1;
        self.stats.received_bytes += data.len() as u64;

        if data.len() < MessageHeader::SERIALIZED_LEN {
            warn!("datagram from {:?} is smaller than one message header - rejecting", from);
            self.stats.rejected_datagrams += 1;
            return;
        }

        if let Some(conn) = self.connections.get_mut(&from) {
            conn.note_datagram_received(data.len());
        } else if let Some(conn) = self.handshakes.get_mut(&from) {
            conn.note_datagram_received(data.len());
        }

        let mut buf = data;
        while !buf.is_empty() {
            if buf.len() < MessageHeader::SERIALIZED_LEN {
                warn!("trailing garbage in datagram from {:?} - dropping {} bytes", from, buf.len());
                break;
            }
            let header = match MessageHeader::deser(&mut buf) {
                Ok(header) => header,
                Err(e) => {
                    warn!("malformed message header from {:?}: {} - dropping datagram tail", from, e);
                    self.stats.rejected_datagrams += 1;
                    break;
                }
            };
            let payload_len = header.payload_bytes();
            if payload_len > buf.len() {
                warn!(
                    "message from {:?} declares {} payload bytes but only {} remain - dropping datagram tail",
                    from, payload_len, buf.len()
                );
                self.stats.rejected_datagrams += 1;
                break;
            }

            let (payload, rest) = buf.split_at(payload_len);
            buf = rest;
            self.dispatch_message(now, from, header, payload).await;
        }

        // retransmits and replies triggered by this datagram go out right away
        if let Some(conn) = self.connections.get_mut(&from) {
            conn.flush_wip(&self.pipeline).await;
        }
    }

    async fn dispatch_message(
        &mut self,
        now: Instant,
        from: SocketAddr,
        header: MessageHeader,
        payload: &[u8],
    ) {
        // peer-level messages are handled here no matter whether a connection exists
        match MessageType::from_tag(header.msg_type_tag) {
            Some(MessageType::Discovery) => {
                self.release_peer_message(IncomingKind::DiscoveryRequest, from, payload, &header, now);
                return;
            }
            Some(MessageType::DiscoveryResponse) => {
                self.release_peer_message(IncomingKind::DiscoveryResponse, from, payload, &header, now);
                return;
            }
            Some(MessageType::NatIntroduction) => {
                self.handle_nat_introduction(from, payload, &header).await;
                return;
            }
            Some(MessageType::NatPunch) => {
                let mut reader = BitReader::new(payload, header.payload_bits as usize);
                if let Ok(punch) = NatPunchPayload::deser(&mut reader) {
                    debug!("NAT punch from {:?} with token {:?}", from, punch.token);
                    let mut msg = IncomingMessage::new(
                        IncomingKind::NatIntroductionSuccess { token: punch.token },
                        Vec::new(),
                        0,
                        now,
                    );
                    msg.sender_addr = Some(from);
                    self.released.push(msg);
                }
                return;
            }
            Some(MessageType::Connect) => {
                if !self.connections.contains_key(&from) && !self.handshakes.contains_key(&from) {
                    self.handle_new_connect(now, from, header, payload).await;
                    return;
                }
                // duplicate Connect on an existing connection falls through below
            }
            Some(MessageType::ConnectResponse) => {
                if !self.connections.contains_key(&from) && !self.handshakes.contains_key(&from) {
                    // port rebind: a pending handshake to this address may answer from a
                    //  different port
                    self.try_rekey_handshake(from);
                }
            }
            _ => {}
        }

        let mut released = std::mem::take(&mut self.released);
        if let Some(conn) = self.connections.get_mut(&from) {
            conn.handle_message(header, payload, now, &self.pipeline, &self.pool, &mut released)
                .await;
        } else if let Some(conn) = self.handshakes.get_mut(&from) {
            conn.handle_message(header, payload, now, &self.pipeline, &self.pool, &mut released)
                .await;
        } else if let Some(MessageType::UnconnectedData) = MessageType::from_tag(header.msg_type_tag)
        {
            let mut data = self.pool.get_buffer(payload.len());
            data.extend_from_slice(payload);
            let mut msg = IncomingMessage::new(
                IncomingKind::UnconnectedData,
                data,
                header.payload_bits as usize,
                now,
            );
            msg.sender_addr = Some(from);
            released.push(msg);
        } else {
            trace!(
                "dropping message type {} from unknown endpoint {:?}",
                header.msg_type_tag,
                from
            );
        }
        self.released = released;
    }

    fn release_peer_message(
        &mut self,
        kind: IncomingKind,
        from: SocketAddr,
        payload: &[u8],
        header: &MessageHeader,
        now: Instant,
    ) {
        let mut data = self.pool.get_buffer(payload.len());
        data.extend_from_slice(payload);
        let mut msg = IncomingMessage::new(kind, data, header.payload_bits as usize, now);
        msg.sender_addr = Some(from);
        self.released.push(msg);
    }

    async fn handle_new_connect(
        &mut self,
        now: Instant,
        from: SocketAddr,
        header: MessageHeader,
        payload: &[u8],
    ) {
        if !self.config.accept_incoming_connections {
            debug!("ignoring Connect from {:?}: not accepting connections", from);
            return;
        }

        let mut reader = BitReader::new(payload, header.payload_bits as usize);
        let connect = match ConnectPayload::deser(&mut reader) {
            Ok(connect) => connect,
            Err(e) => {
                warn!("malformed Connect from {:?}: {}", from, e);
                return;
            }
        };

        if connect.app_identifier != self.config.app_identifier {
            debug!("denying {:?}: wrong application identifier", from);
            self.send_disconnect(from, "wrong application identifier").await;
            return;
        }
        if connect.app_version != self.config.app_version {
            debug!("denying {:?}: wrong application version", from);
            self.send_disconnect(from, "wrong application version").await;
            return;
        }
        if self.connections.len() + self.handshakes.len() >= self.config.maximum_connections {
            debug!("denying {:?}: server full", from);
            self.send_disconnect(from, "server full").await;
            return;
        }

        debug!("incoming connection attempt from {:?} (peer id {:x})", from, connect.peer_id);
        let mut conn = Connection::new_incoming(
            from,
            self.config.clone(),
            self.peer_id,
            &connect,
            now,
        );
        if self
            .config
            .enabled_incoming_kinds
            .contains(crate::message::IncomingKinds::CONNECTION_APPROVAL)
        {
            conn.set_awaiting_approval(now, &mut self.released);
        } else {
            conn.approve(&self.pipeline, now).await;
        }
        self.handshakes.insert(from, conn);
    }

    /// A ConnectResponse arrived from an endpoint we are not talking to: if an initiated
    ///  handshake exists for the same IP on another port, the remote socket was re-bound -
    ///  follow it.
    fn try_rekey_handshake(&mut self, from: SocketAddr) {
        let old_key = self.handshakes.iter().find_map(|(addr, conn)| {
            (addr.ip() == from.ip()
                && *addr != from
                && conn.status() == ConnectionStatus::InitiatedConnect)
                .then_some(*addr)
        });

        if let Some(old_key) = old_key {
            debug!("handshake peer {:?} answered from {:?} - following the rebind", old_key, from);
            let mut conn = self.handshakes.remove(&old_key).expect("key was just found");
            conn.rekey(from);
            self.handshakes.insert(from, conn);
        }
    }

    async fn handle_nat_introduction(&mut self, from: SocketAddr, payload: &[u8], header: &MessageHeader) {
        let mut reader = BitReader::new(payload, header.payload_bits as usize);
        let Ok(intro) = NatIntroductionPayload::deser(&mut reader) else {
            warn!("malformed NAT introduction from {:?}", from);
            return;
        };

        debug!(
            "NAT introduction: punching {:?} and {:?} with token {:?}",
            intro.internal, intro.external, intro.token
        );
        let mut w = BitWriter::new();
        NatPunchPayload { token: intro.token }.ser(&mut w);
        let punch = w.as_bytes().to_vec();
        let bits = w.bit_len();
        self.send_standalone(intro.internal, MessageType::NatPunch, &punch, bits).await;
        self.send_standalone(intro.external, MessageType::NatPunch, &punch, bits).await;
    }

    // ---- commands -------------------------------------------------------------------------

    /// Returns false when the worker should stop.
    async fn handle_command(&mut self, command: Command, now: Instant) -> bool {
        match command {
            Command::Connect { addr } => {
                if self.connections.contains_key(&addr) || self.handshakes.contains_key(&addr) {
                    debug!("connect to {:?} ignored: already connecting or connected", addr);
                    return true;
                }
                let mut conn = Connection::new_outgoing(
                    addr,
                    self.config.clone(),
                    self.peer_id,
                    rand::random::<u32>(),
                    now,
                );
                conn.send_handshake(&self.pipeline, now).await;
                self.handshakes.insert(addr, conn);
            }
            Command::Disconnect { conn, reason } => {
                let mut released = std::mem::take(&mut self.released);
                if let Some(connection) = self.find_connection(conn) {
                    connection.disconnect(&reason, now, &mut released);
                }
                self.released = released;
            }
            Command::Send {
                conn,
                method,
                channel,
                data,
                bit_len,
            } => {
                match self.find_connection(conn) {
                    Some(connection)
                        if !matches!(
                            connection.status(),
                            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected
                        ) =>
                    {
                        connection.enqueue_outgoing(method, channel, data, bit_len);
                    }
                    _ => {
                        debug!("dropping message to {:?}: no usable connection", conn);
                    }
                }
            }
            Command::SendUnconnected { addr, data, bit_len } => {
                self.unconnected_queue.push_back((addr, data, bit_len));
            }
            Command::Approve { conn } => {
                let pipeline = &self.pipeline;
                if let Some(connection) = self.handshakes.values_mut().find(|c| c.id() == conn) {
                    if connection.status() == ConnectionStatus::RespondedAwaitingApproval {
                        connection.approve(pipeline, now).await;
                    }
                }
            }
            Command::Deny { conn, reason } => {
                let pipeline = &self.pipeline;
                let mut released = std::mem::take(&mut self.released);
                if let Some(connection) = self.handshakes.values_mut().find(|c| c.id() == conn) {
                    connection.deny(pipeline, &reason, now, &mut released).await;
                }
                self.released = released;
            }
            Command::Discover { addr } => {
                self.send_standalone(addr, MessageType::Discovery, &[], 0).await;
            }
            Command::DiscoverLocal { port } => {
                let target = SocketAddr::new(self.config.broadcast_address, port);
                if let Err(e) = self.socket.set_broadcast(true) {
                    warn!("enabling broadcast failed: {}", e);
                    return true;
                }
                self.send_standalone(target, MessageType::Discovery, &[], 0).await;
                if let Err(e) = self.socket.set_broadcast(false) {
                    warn!("disabling broadcast failed: {}", e);
                }
            }
            Command::SendDiscoveryResponse { addr, data, bit_len } => {
                self.send_standalone(addr, MessageType::DiscoveryResponse, &data, bit_len)
                    .await;
            }
            Command::NatIntroduce {
                host_internal,
                host_external,
                client_internal,
                client_external,
                token,
            } => {
                // tell each party about the other
                self.send_nat_introduction(client_external, host_internal, host_external, &token)
                    .await;
                self.send_nat_introduction(host_external, client_internal, client_external, &token)
                    .await;
            }
            Command::FlushSendQueue => {
                for conn in self.connections.values_mut() {
                    conn.flush_send_queue(now, &self.pipeline).await;
                }
            }
            Command::Shutdown { reason } => {
                self.shutdown(&reason, now).await;
                return false;
            }
        }
        true
    }

    async fn shutdown(&mut self, reason: &str, now: Instant) {
        info!("shutting down: {}", reason);
        let mut released = std::mem::take(&mut self.released);
        for conn in self
            .connections
            .values_mut()
            .chain(self.handshakes.values_mut())
        {
            conn.disconnect(reason, now, &mut released);
            // one final heartbeat flushes queued traffic and the Disconnect itself
            conn.heartbeat(now, &self.pipeline, &mut released).await;
        }
        self.connections.clear();
        self.handshakes.clear();
        self.released = released;
        self.flush_released();
    }

    fn find_connection(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections
            .values_mut()
            .chain(self.handshakes.values_mut())
            .find(|c| c.id() == id)
    }

    /// Promote finished handshakes and drop dead connections.
    fn sweep(&mut self) {
        let promoted: Vec<SocketAddr> = self
            .handshakes
            .iter()
            .filter(|(_, conn)| conn.status() == ConnectionStatus::Connected)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in promoted {
            let conn = self.handshakes.remove(&addr).expect("address was just seen");
            debug!("handshake with {:?} complete", addr);
            self.connections.insert(conn.remote_addr(), conn);
        }

        self.handshakes
            .retain(|_, conn| conn.status() != ConnectionStatus::Disconnected);
        self.connections
            .retain(|_, conn| conn.status() != ConnectionStatus::Disconnected);
    }

    /// Hand everything collected this step to the application, honoring the enabled-kinds
    ///  filter.
    fn flush_released(&mut self) {
        for msg in self.released.drain(..) {
            if self.config.enabled_incoming_kinds.contains(msg.kind.flag()) {
                // a closed released queue just means the application is gone
                if self.released_tx.send(msg).is_err() {
                    return;
                }
            } else {
                self.pool.return_buffer(msg.into_payload_buffer());
            }
        }
    }

    // ---- sending --------------------------------------------------------------------------

    async fn send_standalone(
        &mut self,
        to: SocketAddr,
        msg_type: MessageType,
        payload: &[u8],
        bit_len: usize,
    ) {
        // connectionless messages are never fragmented, so they must fit one conservative
        //  datagram
        if payload.len() + MessageHeader::SERIALIZED_LEN > self.config.maximum_transmission_unit {
            warn!(
                "dropping {} byte connectionless message to {:?}: exceeds the {} byte MTU",
                payload.len(),
                to,
                self.config.maximum_transmission_unit
            );
            return;
        }

        let mut datagram = Vec::with_capacity(MessageHeader::SERIALIZED_LEN + payload.len());
        MessageHeader {
            msg_type_tag: msg_type.tag(),
            is_fragment: false,
            sequence: SeqNr::ZERO,
            payload_bits: bit_len as u16,
        }
        .ser(&mut datagram);
        datagram.extend_from_slice(payload);

        match self.pipeline.send_datagram(to, &datagram).await {
            Ok(()) => {
                self.stats.sent_datagrams += 1;
                self.stats.sent_bytes += datagram.len() as u64;
            }
            Err(e) => warn!("send to {:?} failed: {}", to, e),
        }
    }

    async fn send_disconnect(&mut self, to: SocketAddr, reason: &str) {
        let mut w = BitWriter::new();
        DisconnectPayload {
            reason: reason.to_string(),
        }
        .ser(&mut w);
        let data = w.as_bytes().to_vec();
        let bits = w.bit_len();
        self.send_standalone(to, MessageType::Disconnect, &data, bits).await;
    }

    async fn send_nat_introduction(
        &mut self,
        to: SocketAddr,
        internal: SocketAddr,
        external: SocketAddr,
        token: &str,
    ) {
        let mut w = BitWriter::new();
        NatIntroductionPayload {
            internal,
            external,
            token: token.to_string(),
        }
        .ser(&mut w);
        let data = w.as_bytes().to_vec();
        let bits = w.bit_len();
        self.send_standalone(to, MessageType::NatIntroduction, &data, bits).await;
    }
}
