//! Payload codecs for the library control messages. The enclosing 5-byte message header is
//!  handled separately; these codecs cover only the payload bits.

use crate::bit_buffer::{BitReader, BitWriter};
use anyhow::bail;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub(crate) fn write_socket_addr(w: &mut BitWriter, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            w.write_bool(false);
            w.write_u32(v4.ip().to_bits());
            w.write_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            w.write_bool(true);
            w.write_u64((v6.ip().to_bits() >> 64) as u64);
            w.write_u64(v6.ip().to_bits() as u64);
            w.write_u16(v6.port());
        }
    }
}

pub(crate) fn read_socket_addr(r: &mut BitReader) -> anyhow::Result<SocketAddr> {
    if r.read_bool()? {
        let high = r.read_u64()? as u128;
        let low = r.read_u64()? as u128;
        let port = r.read_u16()?;
        Ok(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::from_bits((high << 64) | low)),
            port,
        ))
    } else {
        let ip = Ipv4Addr::from_bits(r.read_u32()?);
        let port = r.read_u16()?;
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    }
}

/// Sent by the initiator to open a connection; retransmitted with doubling delay until
///  answered or the attempt limit is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConnectPayload {
    pub app_identifier: String,
    pub app_version: u32,
    pub peer_id: u64,
    /// random per-attempt value, echoed in the response so a stale response cannot complete
    ///  a newer handshake
    pub nonce: u32,
}

impl ConnectPayload {
    pub fn ser(&self, w: &mut BitWriter) {
        w.write_string(&self.app_identifier);
        w.write_var_u32(self.app_version);
        w.write_u64(self.peer_id);
        w.write_u32(self.nonce);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<ConnectPayload> {
        Ok(ConnectPayload {
            app_identifier: r.read_string()?,
            app_version: r.read_var_u32()?,
            peer_id: r.read_u64()?,
            nonce: r.read_u32()?,
        })
    }
}

/// Sent by the accepting side in answer to a Connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConnectResponsePayload {
    pub app_identifier: String,
    pub app_version: u32,
    pub peer_id: u64,
    /// echo of [ConnectPayload::nonce]
    pub nonce: u32,
}

impl ConnectResponsePayload {
    pub fn ser(&self, w: &mut BitWriter) {
        w.write_string(&self.app_identifier);
        w.write_var_u32(self.app_version);
        w.write_u64(self.peer_id);
        w.write_u32(self.nonce);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<ConnectResponsePayload> {
        Ok(ConnectResponsePayload {
            app_identifier: r.read_string()?,
            app_version: r.read_var_u32()?,
            peer_id: r.read_u64()?,
            nonce: r.read_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DisconnectPayload {
    pub reason: String,
}

impl DisconnectPayload {
    pub fn ser(&self, w: &mut BitWriter) {
        w.write_string(&self.reason);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<DisconnectPayload> {
        Ok(DisconnectPayload {
            reason: r.read_string()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PingPayload {
    /// matches a Pong to the Ping it answers
    pub ping_number: u8,
}

impl PingPayload {
    pub fn ser(&self, w: &mut BitWriter) {
        w.write_u8(self.ping_number);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<PingPayload> {
        Ok(PingPayload {
            ping_number: r.read_u8()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExpandMtuPayload {
    /// candidate datagram size in bytes; the request datagram is padded to exactly this size
    pub size: u32,
}

impl ExpandMtuPayload {
    pub fn ser(&self, w: &mut BitWriter) {
        w.write_var_u32(self.size);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<ExpandMtuPayload> {
        let size = r.read_var_u32()?;
        if size == 0 {
            bail!("MTU probe with zero size");
        }
        Ok(ExpandMtuPayload { size })
    }
}

/// Sent by an introducer to both parties; carries the other party's endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NatIntroductionPayload {
    pub internal: SocketAddr,
    pub external: SocketAddr,
    pub token: String,
}

impl NatIntroductionPayload {
    pub fn ser(&self, w: &mut BitWriter) {
        write_socket_addr(w, self.internal);
        write_socket_addr(w, self.external);
        w.write_string(&self.token);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<NatIntroductionPayload> {
        Ok(NatIntroductionPayload {
            internal: read_socket_addr(r)?,
            external: read_socket_addr(r)?,
            token: r.read_string()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NatPunchPayload {
    pub token: String,
}

impl NatPunchPayload {
    pub fn ser(&self, w: &mut BitWriter) {
        w.write_string(&self.token);
    }

    pub fn deser(r: &mut BitReader) -> anyhow::Result<NatPunchPayload> {
        Ok(NatPunchPayload {
            token: r.read_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    fn roundtrip<T>(ser: impl Fn(&T, &mut BitWriter), deser: impl Fn(&mut BitReader) -> anyhow::Result<T>, value: &T) -> T {
        let mut w = BitWriter::new();
        ser(value, &mut w);
        let mut r = BitReader::new(w.as_bytes(), w.bit_len());
        let result = deser(&mut r).unwrap();
        assert_eq!(r.remaining_bits(), 0);
        result
    }

    #[rstest]
    #[case::v4("1.2.3.4:888")]
    #[case::v4_zero("0.0.0.0:0")]
    #[case::v6("[1111:2222::3333:4444]:17")]
    fn test_socket_addr_roundtrip(#[case] addr: &str) {
        let addr = SocketAddr::from_str(addr).unwrap();
        let restored = roundtrip(
            |a, w| write_socket_addr(w, *a),
            |r| read_socket_addr(r),
            &addr,
        );
        assert_eq!(restored, addr);
    }

    #[test]
    fn test_connect_roundtrip() {
        let payload = ConnectPayload {
            app_identifier: "my-game".to_string(),
            app_version: 3,
            peer_id: 0xdead_beef_1234_5678,
            nonce: 0xcafe_babe,
        };
        assert_eq!(
            roundtrip(ConnectPayload::ser, ConnectPayload::deser, &payload),
            payload
        );
    }

    #[test]
    fn test_connect_response_roundtrip() {
        let payload = ConnectResponsePayload {
            app_identifier: "my-game".to_string(),
            app_version: 3,
            peer_id: 17,
            nonce: 4,
        };
        assert_eq!(
            roundtrip(ConnectResponsePayload::ser, ConnectResponsePayload::deser, &payload),
            payload
        );
    }

    #[rstest]
    #[case::empty("")]
    #[case::text("connection timed out")]
    fn test_disconnect_roundtrip(#[case] reason: &str) {
        let payload = DisconnectPayload {
            reason: reason.to_string(),
        };
        assert_eq!(
            roundtrip(DisconnectPayload::ser, DisconnectPayload::deser, &payload),
            payload
        );
    }

    #[test]
    fn test_mtu_payload_rejects_zero() {
        let mut w = BitWriter::new();
        w.write_var_u32(0);
        let mut r = BitReader::new(w.as_bytes(), w.bit_len());
        assert!(ExpandMtuPayload::deser(&mut r).is_err());
    }

    #[test]
    fn test_nat_introduction_roundtrip() {
        let payload = NatIntroductionPayload {
            internal: SocketAddr::from_str("192.168.1.4:14242").unwrap(),
            external: SocketAddr::from_str("84.12.13.14:61000").unwrap(),
            token: "party-42".to_string(),
        };
        assert_eq!(
            roundtrip(NatIntroductionPayload::ser, NatIntroductionPayload::deser, &payload),
            payload
        );
    }
}
