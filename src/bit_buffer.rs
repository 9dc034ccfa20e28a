//! Bit-packed buffers underlying all message payloads.
//!
//! Payload lengths are tracked in *bits* end to end: a writer records how many bits were
//!  written, the wire header transports that count, and the reader refuses to read past it.
//!  Multi-bit values are stored least-significant-bit first, i.e. bit `i` of the stream is bit
//!  `i % 8` of byte `i / 8`, and multi-byte integers are little-endian. Variable-length integers
//!  use the usual 7-bit groups with a continuation bit.

use anyhow::bail;
use std::cmp::min;

/// Number of bits needed to represent all values in `0..=range`.
pub fn bits_for_range(range: u32) -> u32 {
    if range == 0 {
        0
    } else {
        32 - range.leading_zeros()
    }
}

/// An append-only bit-level writer over a growable byte buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter::default()
    }

    pub fn with_capacity(capacity_bytes: usize) -> BitWriter {
        BitWriter {
            buf: Vec::with_capacity(capacity_bytes),
            bit_len: 0,
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8)
    }

    /// The written bits, with the final partial byte (if any) zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.byte_len()]
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, usize) {
        let byte_len = self.byte_len();
        let mut buf = self.buf;
        buf.truncate(byte_len);
        (buf, self.bit_len)
    }

    /// Append the `bits` least significant bits of `value`.
    pub fn write_bits_u64(&mut self, value: u64, bits: u32) {
        assert!(bits <= 64, "cannot write more than 64 bits at once");
        if bits == 0 {
            return;
        }

        let needed_bytes = (self.bit_len + bits as usize).div_ceil(8);
        if self.buf.len() < needed_bytes {
            self.buf.resize(needed_bytes, 0);
        }

        let mut value = if bits == 64 {
            value
        } else {
            value & ((1u64 << bits) - 1)
        };
        let mut remaining = bits;
        while remaining > 0 {
            let byte_idx = self.bit_len / 8;
            let bit_idx = (self.bit_len % 8) as u32;
            let take = min(8 - bit_idx, remaining);

            let chunk = (value & ((1u64 << take) - 1)) as u8;
            self.buf[byte_idx] |= chunk << bit_idx;

            value >>= take;
            self.bit_len += take as usize;
            remaining -= take;
        }
    }

    pub fn write_bits_u32(&mut self, value: u32, bits: u32) {
        assert!(bits <= 32);
        self.write_bits_u64(value as u64, bits);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits_u64(value as u64, 1);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits_u64(value as u64, 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits_u64(value as u64, 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits_u64(value as u64, 32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bits_u64(value, 64);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bits_u64(value as u32 as u64, 32);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bits_u64(value as u64, 64);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let group = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(group);
                return;
            }
            self.write_u8(group | 0x80);
        }
    }

    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    pub fn write_var_i64(&mut self, value: i64) {
        // zig-zag so small negative values stay short
        self.write_var_u64(((value << 1) ^ (value >> 63)) as u64);
    }

    pub fn write_var_i32(&mut self, value: i32) {
        self.write_var_i64(value as i64);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_len % 8 == 0 {
            // fast path: byte aligned
            let byte_len = self.byte_len();
            self.buf.truncate(byte_len);
            self.buf.extend_from_slice(bytes);
            self.bit_len += bytes.len() * 8;
        } else {
            for &b in bytes {
                self.write_u8(b);
            }
        }
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_var_u32(value.len() as u32);
        self.write_bytes(value.as_bytes());
    }

    /// Write `value` from the closed range `[min, max]` using the minimum number of bits.
    pub fn write_ranged_u32(&mut self, value: u32, min_value: u32, max_value: u32) {
        assert!(min_value <= max_value);
        let clamped = value.clamp(min_value, max_value);
        self.write_bits_u32(clamped - min_value, bits_for_range(max_value - min_value));
    }

    /// Quantize `value` from `[min, max]` into `bits` bits.
    pub fn write_ranged_f32(&mut self, value: f32, min_value: f32, max_value: f32, bits: u32) {
        assert!(bits >= 1 && bits <= 32);
        let unit = ((value - min_value) / (max_value - min_value)).clamp(0.0, 1.0);
        let max_int = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
        self.write_bits_u32((unit * max_int as f32).round() as u32, bits);
    }

    /// Pad with zero bits up to the next byte boundary.
    pub fn align_to_byte(&mut self) {
        let rem = self.bit_len % 8;
        if rem != 0 {
            self.write_bits_u64(0, 8 - rem as u32);
        }
    }
}

/// A bit-level reader over a borrowed byte slice with an explicit bit length.
pub struct BitReader<'a> {
    buf: &'a [u8],
    bit_len: usize,
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8], bit_len: usize) -> BitReader<'a> {
        debug_assert!(bit_len <= buf.len() * 8);
        BitReader {
            buf,
            bit_len,
            position: 0,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        self.bit_len - self.position
    }

    pub fn position_bits(&self) -> usize {
        self.position
    }

    pub fn read_bits_u64(&mut self, bits: u32) -> anyhow::Result<u64> {
        assert!(bits <= 64, "cannot read more than 64 bits at once");
        if self.remaining_bits() < bits as usize {
            bail!(
                "buffer underrun: {} bits requested but only {} remain",
                bits,
                self.remaining_bits()
            );
        }

        let mut result = 0u64;
        let mut got = 0u32;
        while got < bits {
            let byte_idx = self.position / 8;
            let bit_idx = (self.position % 8) as u32;
            let take = min(8 - bit_idx, bits - got);

            let chunk = (self.buf[byte_idx] >> bit_idx) & (((1u16 << take) - 1) as u8);
            result |= (chunk as u64) << got;

            got += take;
            self.position += take as usize;
        }
        Ok(result)
    }

    pub fn read_bits_u32(&mut self, bits: u32) -> anyhow::Result<u32> {
        assert!(bits <= 32);
        Ok(self.read_bits_u64(bits)? as u32)
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_bits_u64(1)? != 0)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.read_bits_u64(8)? as u8)
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        Ok(self.read_bits_u64(16)? as u16)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.read_bits_u64(32)? as u32)
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        self.read_bits_u64(64)
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> anyhow::Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> anyhow::Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_var_u64(&mut self) -> anyhow::Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let group = self.read_u8()?;
            if shift >= 64 || (shift == 63 && group > 1) {
                bail!("variable-length integer exceeds 64 bits");
            }
            result |= ((group & 0x7f) as u64) << shift;
            if group & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_var_u32(&mut self) -> anyhow::Result<u32> {
        let raw = self.read_var_u64()?;
        if raw > u32::MAX as u64 {
            bail!("variable-length integer exceeds 32 bits");
        }
        Ok(raw as u32)
    }

    pub fn read_var_i64(&mut self) -> anyhow::Result<i64> {
        let raw = self.read_var_u64()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn read_var_i32(&mut self) -> anyhow::Result<i32> {
        let raw = self.read_var_i64()?;
        if raw < i32::MIN as i64 || raw > i32::MAX as i64 {
            bail!("variable-length integer exceeds 32 bits");
        }
        Ok(raw as i32)
    }

    pub fn read_bytes(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.remaining_bits() < len * 8 {
            bail!(
                "buffer underrun: {} bytes requested but only {} bits remain",
                len,
                self.remaining_bits()
            );
        }

        if self.position % 8 == 0 {
            let start = self.position / 8;
            self.position += len * 8;
            Ok(self.buf[start..start + len].to_vec())
        } else {
            let mut result = Vec::with_capacity(len);
            for _ in 0..len {
                result.push(self.read_u8()?);
            }
            Ok(result)
        }
    }

    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let len = self.read_var_u32()? as usize;
        if len * 8 > self.remaining_bits() {
            bail!("declared string length {} exceeds remaining payload", len);
        }
        Ok(String::from_utf8(self.read_bytes(len)?)?)
    }

    pub fn read_ranged_u32(&mut self, min_value: u32, max_value: u32) -> anyhow::Result<u32> {
        assert!(min_value <= max_value);
        let raw = self.read_bits_u32(bits_for_range(max_value - min_value))?;
        Ok(min(min_value + raw, max_value))
    }

    pub fn read_ranged_f32(
        &mut self,
        min_value: f32,
        max_value: f32,
        bits: u32,
    ) -> anyhow::Result<f32> {
        let raw = self.read_bits_u32(bits)?;
        let max_int = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
        Ok(min_value + (raw as f32 / max_int as f32) * (max_value - min_value))
    }

    /// Skip to the next byte boundary.
    pub fn align_to_byte(&mut self) -> anyhow::Result<()> {
        let rem = self.position % 8;
        if rem != 0 {
            self.read_bits_u64(8 - rem as u32)?;
        }
        Ok(())
    }
}
