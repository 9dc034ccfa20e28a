use std::fmt::{Display, Formatter};

/// Traffic counters for one connection, maintained by the worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    pub sent_datagrams: u64,
    pub sent_bytes: u64,
    pub sent_messages: u64,
    pub received_datagrams: u64,
    pub received_bytes: u64,
    pub received_messages: u64,
    /// reliable messages that were transmitted more than once
    pub resent_messages: u64,
    /// messages discarded as duplicates or out of window
    pub dropped_messages: u64,
}

impl Display for ConnectionStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} msgs / {} dgrams / {} B, received {} msgs / {} dgrams / {} B, {} resent, {} dropped",
            self.sent_messages,
            self.sent_datagrams,
            self.sent_bytes,
            self.received_messages,
            self.received_datagrams,
            self.received_bytes,
            self.resent_messages,
            self.dropped_messages,
        )
    }
}

/// Peer-wide traffic counters, including traffic that does not belong to any connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    pub sent_datagrams: u64,
    pub sent_bytes: u64,
    pub received_datagrams: u64,
    pub received_bytes: u64,
    /// datagrams dropped because they could not be parsed
    pub rejected_datagrams: u64,
}

impl Display for PeerStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} dgrams / {} B, received {} dgrams / {} B, {} rejected",
            self.sent_datagrams,
            self.sent_bytes,
            self.received_datagrams,
            self.received_bytes,
            self.rejected_datagrams,
        )
    }
}
