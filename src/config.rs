use crate::message::IncomingKinds;
use anyhow::bail;
use std::net::IpAddr;
use std::time::Duration;

/// Tuning parameters for a [crate::Peer]. All values are read once when the peer starts; the
///  worker keeps an immutable snapshot, so mutating a config after `Peer::start` has no effect.
pub struct PeerConfig {
    /// Identifies the application-level protocol. Both sides of a connection must use the same
    ///  identifier; a mismatch is answered with a Disconnect during the handshake.
    pub app_identifier: String,

    /// Application protocol version, checked during the handshake the same way as
    ///  [PeerConfig::app_identifier].
    pub app_version: u32,

    /// Local address to bind to.
    pub local_address: IpAddr,

    /// When enabled and [PeerConfig::local_address] is the IPv4 wildcard, the socket binds
    ///  the IPv6 wildcard instead, accepting both address families where the OS defaults to
    ///  dual-stack sockets.
    pub dual_stack: bool,

    /// Local port; 0 lets the OS pick an ephemeral port.
    pub port: u16,

    /// Destination address for [crate::Peer::discover_local] broadcasts.
    pub broadcast_address: IpAddr,

    /// Whether incoming connection attempts are acted on at all. Servers enable this; pure
    ///  clients leave it off and have unsolicited Connects ignored.
    pub accept_incoming_connections: bool,

    /// Connects beyond this limit are denied with reason "server full".
    pub maximum_connections: usize,

    /// Size of the preallocated datagram receive buffer. Datagrams larger than this are
    ///  truncated by the OS, so this bounds the largest receivable datagram.
    pub receive_buffer_size: usize,

    /// Capacity hint for per-connection datagram assembly buffers.
    pub send_buffer_size: usize,

    /// Initial capacity of buffers handed out for building outgoing messages.
    pub default_outgoing_message_capacity: usize,

    /// How often a Ping is sent to measure RTT and prove liveness.
    pub ping_interval: Duration,

    /// A connection is dropped with reason "timeout" when nothing is heard from the remote
    ///  peer for this long.
    pub connection_timeout: Duration,

    /// Initial delay before an unanswered handshake message is retransmitted; doubles with
    ///  every retry.
    pub resend_handshake_interval: Duration,

    /// Number of handshake transmissions before the connection attempt is abandoned.
    pub maximum_handshake_attempts: u32,

    /// When enabled (the default) every heartbeat flushes the per-channel send queues. When
    ///  disabled, queued messages are only sent on an explicit `Peer::flush_send_queue`.
    pub auto_flush_send_queue: bool,

    /// Initial (and minimum) MTU in bytes. Chosen so the resulting datagrams pass practically
    ///  every path; MTU expansion probes upward from here.
    pub maximum_transmission_unit: usize,

    /// Upper bound for MTU expansion probes.
    pub expand_mtu_ceiling: usize,

    pub auto_expand_mtu: bool,

    /// Number of unanswered probes at one candidate size before the candidate is considered
    ///  too large.
    pub expand_mtu_fail_attempts: u32,

    /// Minimum interval between two MTU probes.
    pub expand_mtu_frequency: Duration,

    /// Upper bound on concurrently reassembling fragment groups per connection; the oldest
    ///  group is evicted beyond this.
    pub max_fragment_groups: usize,

    /// Which non-data events are released to the application.
    pub enabled_incoming_kinds: IncomingKinds,

    /// Debug link simulation, applied on the send path. All-zero (the default) disables it.
    pub simulation: LinkSimulation,
}

impl PeerConfig {
    pub fn new(app_identifier: impl Into<String>) -> PeerConfig {
        PeerConfig {
            app_identifier: app_identifier.into(),
            app_version: 0,
            local_address: IpAddr::from([0, 0, 0, 0]),
            dual_stack: false,
            port: 0,
            broadcast_address: IpAddr::from([255, 255, 255, 255]),
            accept_incoming_connections: false,
            maximum_connections: 32,
            receive_buffer_size: 128 * 1024,
            send_buffer_size: 128 * 1024,
            default_outgoing_message_capacity: 16,
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            resend_handshake_interval: Duration::from_secs(3),
            maximum_handshake_attempts: 5,
            auto_flush_send_queue: true,
            maximum_transmission_unit: 512,
            expand_mtu_ceiling: 1408,
            auto_expand_mtu: true,
            expand_mtu_fail_attempts: 5,
            expand_mtu_frequency: Duration::from_secs(2),
            max_fragment_groups: 32,
            enabled_incoming_kinds: IncomingKinds::DATA | IncomingKinds::STATUS_CHANGED,
            simulation: LinkSimulation::default(),
        }
    }

    pub fn enable_incoming_kind(&mut self, kinds: IncomingKinds) {
        self.enabled_incoming_kinds |= kinds;
    }

    pub fn disable_incoming_kind(&mut self, kinds: IncomingKinds) {
        self.enabled_incoming_kinds &= !kinds;
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app_identifier.is_empty() {
            bail!("app_identifier must not be empty");
        }
        if self.maximum_transmission_unit < 128 {
            bail!("maximum_transmission_unit is too small to fit handshake messages");
        }
        if self.expand_mtu_ceiling < self.maximum_transmission_unit {
            bail!("expand_mtu_ceiling must not be below maximum_transmission_unit");
        }
        if self.receive_buffer_size < self.expand_mtu_ceiling {
            bail!("receive_buffer_size must hold at least one maximum-size datagram");
        }
        if self.maximum_handshake_attempts == 0 {
            bail!("maximum_handshake_attempts must be at least 1");
        }
        if self.connection_timeout <= self.ping_interval {
            bail!("connection_timeout must exceed ping_interval, otherwise every connection times out between pings");
        }
        self.simulation.validate()?;
        Ok(())
    }
}

/// Artificial link degradation for tests and soak runs: packet loss, duplication and added
///  latency on outgoing datagrams.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkSimulation {
    /// chance in `[0, 1)` that an outgoing datagram is silently dropped
    pub loss_chance: f32,
    /// chance in `[0, 1)` that an outgoing datagram is sent twice
    pub duplicate_chance: f32,
    /// fixed added one-way latency
    pub minimum_latency: Duration,
    /// additional random latency, uniform in `[0, random_latency)`
    pub random_latency: Duration,
}

impl LinkSimulation {
    pub fn is_active(&self) -> bool {
        self.loss_chance > 0.0
            || self.duplicate_chance > 0.0
            || !self.minimum_latency.is_zero()
            || !self.random_latency.is_zero()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.loss_chance) {
            bail!("simulated loss chance must be in [0, 1)");
        }
        if !(0.0..1.0).contains(&self.duplicate_chance) {
            bail!("simulated duplicate chance must be in [0, 1)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PeerConfig::new("test-app").validate().is_ok());
    }

    #[rstest]
    #[case::empty_app_id(|c: &mut PeerConfig| c.app_identifier.clear())]
    #[case::tiny_mtu(|c: &mut PeerConfig| c.maximum_transmission_unit = 64)]
    #[case::ceiling_below_mtu(|c: &mut PeerConfig| c.expand_mtu_ceiling = 256)]
    #[case::tiny_receive_buffer(|c: &mut PeerConfig| c.receive_buffer_size = 100)]
    #[case::no_handshake_attempts(|c: &mut PeerConfig| c.maximum_handshake_attempts = 0)]
    #[case::timeout_below_ping(|c: &mut PeerConfig| c.connection_timeout = Duration::from_secs(1))]
    #[case::loss_chance_one(|c: &mut PeerConfig| c.simulation.loss_chance = 1.0)]
    #[case::negative_duplicates(|c: &mut PeerConfig| c.simulation.duplicate_chance = -0.5)]
    fn test_invalid_configs(#[case] break_it: fn(&mut PeerConfig)) {
        let mut config = PeerConfig::new("test-app");
        break_it(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_incoming_kind_toggles() {
        let mut config = PeerConfig::new("test-app");
        assert!(config.enabled_incoming_kinds.contains(IncomingKinds::DATA));
        assert!(!config.enabled_incoming_kinds.contains(IncomingKinds::WARNING));

        config.enable_incoming_kind(IncomingKinds::WARNING | IncomingKinds::DISCOVERY_REQUEST);
        assert!(config.enabled_incoming_kinds.contains(IncomingKinds::WARNING));

        config.disable_incoming_kind(IncomingKinds::WARNING);
        assert!(!config.enabled_incoming_kinds.contains(IncomingKinds::WARNING));
        assert!(config
            .enabled_incoming_kinds
            .contains(IncomingKinds::DISCOVERY_REQUEST));
    }

    #[test]
    fn test_simulation_activity() {
        let mut sim = LinkSimulation::default();
        assert!(!sim.is_active());
        sim.loss_chance = 0.1;
        assert!(sim.is_active());
    }
}
