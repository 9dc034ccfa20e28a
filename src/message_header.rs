use crate::seq::SeqNr;
use anyhow::bail;
use bytes::{Buf, BufMut};

/// The fixed 5-byte header preceding every message in a datagram.
///
/// ```ascii
/// 0:    message type tag (u8)
/// 1:    bit 0: fragment flag; bits 1..7: low 7 bits of the sequence number
/// 2:    high 8 bits of the sequence number
/// 3..4: payload length in bits (u16 LE)
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct MessageHeader {
    pub msg_type_tag: u8,
    pub is_fragment: bool,
    pub sequence: SeqNr,
    pub payload_bits: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 5;

    pub fn payload_bytes(&self) -> usize {
        (self.payload_bits as usize).div_ceil(8)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let seq = self.sequence.to_raw();
        buf.put_u8(self.msg_type_tag);
        buf.put_u8(((seq & 0x7f) as u8) << 1 | self.is_fragment as u8);
        buf.put_u8((seq >> 7) as u8);
        buf.put_u16_le(self.payload_bits);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!(
                "truncated message header: {} bytes remaining",
                buf.remaining()
            );
        }

        let msg_type_tag = buf.get_u8();
        let low = buf.get_u8();
        let high = buf.get_u8();
        let payload_bits = buf.get_u16_le();

        Ok(MessageHeader {
            msg_type_tag,
            is_fragment: low & 1 != 0,
            sequence: SeqNr::from_raw(((low >> 1) as u16) | ((high as u16) << 7)),
            payload_bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, false, 0, 0)]
    #[case::plain(34, false, 17, 1024)]
    #[case::fragment(67, true, 129, 8000)]
    #[case::max_seq(98, false, 32767, u16::MAX)]
    #[case::max_seq_fragment(1, true, 32767, 7)]
    #[case::seq_low_boundary(2, false, 127, 8)]
    #[case::seq_high_boundary(2, true, 128, 8)]
    fn test_roundtrip(
        #[case] tag: u8,
        #[case] is_fragment: bool,
        #[case] seq: u16,
        #[case] payload_bits: u16,
    ) {
        let header = MessageHeader {
            msg_type_tag: tag,
            is_fragment,
            sequence: SeqNr::from_raw(seq),
            payload_bits,
        };

        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_truncated_header_is_error() {
        let mut b: &[u8] = &[1, 2, 3, 4];
        assert!(MessageHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::aligned(16, 2)]
    #[case::partial(17, 3)]
    #[case::zero(0, 0)]
    fn test_payload_bytes(#[case] bits: u16, #[case] expected_bytes: usize) {
        let header = MessageHeader {
            msg_type_tag: 1,
            is_fragment: false,
            sequence: SeqNr::ZERO,
            payload_bits: bits,
        };
        assert_eq!(header.payload_bytes(), expected_bytes);
    }
}
