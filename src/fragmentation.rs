//! Splitting of oversize payloads into MTU-sized chunks and their reassembly.
//!
//! Each chunk travels as an independent reliable message with the fragment flag set; its
//!  payload starts with a varint fragment header followed by the chunk bytes. Reassembly is
//!  keyed by a per-connection group id and bounded: when too many groups are in flight at
//!  once, the oldest one is evicted.

use crate::message::WirePayload;
use crate::message_header::MessageHeader;
use crate::seq::BitVector;
use anyhow::bail;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FragmentHeader {
    pub group: u32,
    /// bit length of the original, unfragmented payload
    pub total_bits: u32,
    pub chunk_size: u32,
    pub chunk_number: u32,
}

impl FragmentHeader {
    /// worst-case serialized size, for MTU budgeting
    pub const MAX_SERIALIZED_LEN: usize = 4 * 5;

    pub fn num_chunks(&self) -> u32 {
        let total_bytes = (self.total_bits as u64).div_ceil(8) as u32;
        total_bytes.div_ceil(self.chunk_size.max(1))
    }

    pub fn ser(&self, buf: &mut Vec<u8>) {
        buf.put_u32_varint(self.group);
        buf.put_u32_varint(self.total_bits);
        buf.put_u32_varint(self.chunk_size);
        buf.put_u32_varint(self.chunk_number);
    }

    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<FragmentHeader> {
        let mut next = || {
            buf.try_get_u32_varint()
                .map_err(|e| anyhow::anyhow!("malformed fragment header: {:?}", e))
        };
        let header = FragmentHeader {
            group: next()?,
            total_bits: next()?,
            chunk_size: next()?,
            chunk_number: next()?,
        };
        if header.chunk_size == 0 {
            bail!("fragment header with zero chunk size");
        }
        Ok(header)
    }
}

/// The largest chunk payload that keeps a fragment message within `mtu` on the wire.
pub(crate) fn best_chunk_size(mtu: usize) -> usize {
    mtu.saturating_sub(MessageHeader::SERIALIZED_LEN + FragmentHeader::MAX_SERIALIZED_LEN)
        .max(1)
}

/// Split `payload` into fragment messages of at most `chunk_size` payload bytes each.
pub(crate) fn split_payload(
    group: u32,
    payload: &[u8],
    total_bits: usize,
    chunk_size: usize,
) -> Vec<Arc<WirePayload>> {
    debug_assert!(total_bits.div_ceil(8) == payload.len());

    payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(chunk_number, chunk)| {
            let header = FragmentHeader {
                group,
                total_bits: total_bits as u32,
                chunk_size: chunk_size as u32,
                chunk_number: chunk_number as u32,
            };

            let mut data = Vec::with_capacity(FragmentHeader::MAX_SERIALIZED_LEN + chunk.len());
            header.ser(&mut data);
            data.extend_from_slice(chunk);

            let bit_len = data.len() * 8;
            Arc::new(WirePayload {
                data,
                bit_len,
                is_fragment: true,
            })
        })
        .collect()
}

struct FragmentGroup {
    total_bits: u32,
    chunk_size: u32,
    num_chunks: u32,
    received: BitVector,
    received_count: u32,
    buffer: Vec<u8>,
}

/// Per-connection reassembly state.
pub(crate) struct FragmentAssembler {
    groups: FxHashMap<u32, FragmentGroup>,
    arrival_order: VecDeque<u32>,
    max_groups: usize,
}

impl FragmentAssembler {
    pub fn new(max_groups: usize) -> FragmentAssembler {
        FragmentAssembler {
            groups: FxHashMap::default(),
            arrival_order: VecDeque::new(),
            max_groups: max_groups.max(1),
        }
    }

    /// Record one chunk. Returns the reassembled `(payload, bit_len)` when the group is
    ///  complete.
    pub fn on_chunk(
        &mut self,
        header: &FragmentHeader,
        chunk: &[u8],
    ) -> anyhow::Result<Option<(Vec<u8>, usize)>> {
        let num_chunks = header.num_chunks();
        if header.chunk_number >= num_chunks {
            bail!(
                "fragment chunk {} out of range for group of {} chunks",
                header.chunk_number,
                num_chunks
            );
        }

        let group = match self.groups.get_mut(&header.group) {
            Some(group) => {
                if group.total_bits != header.total_bits || group.chunk_size != header.chunk_size {
                    bail!("fragment group {} metadata changed between chunks", header.group);
                }
                group
            }
            None => {
                if self.groups.len() >= self.max_groups {
                    self.evict_oldest();
                }
                self.arrival_order.push_back(header.group);
                self.groups.entry(header.group).or_insert(FragmentGroup {
                    total_bits: header.total_bits,
                    chunk_size: header.chunk_size,
                    num_chunks,
                    received: BitVector::new(num_chunks as usize),
                    received_count: 0,
                    buffer: vec![0; (header.total_bits as usize).div_ceil(8)],
                })
            }
        };

        let offset = (header.chunk_number * header.chunk_size) as usize;
        let expected_len = (group.buffer.len() - offset).min(header.chunk_size as usize);
        if chunk.len() < expected_len {
            bail!(
                "fragment chunk {} of group {} is {} bytes, expected {}",
                header.chunk_number,
                header.group,
                chunk.len(),
                expected_len
            );
        }

        if !group.received.get(header.chunk_number as usize) {
            group.buffer[offset..offset + expected_len].copy_from_slice(&chunk[..expected_len]);
            group.received.set(header.chunk_number as usize);
            group.received_count += 1;
        }

        if group.received_count == group.num_chunks {
            let group = self.groups.remove(&header.group).expect("group is present");
            self.arrival_order.retain(|&g| g != header.group);
            return Ok(Some((group.buffer, group.total_bits as usize)));
        }
        Ok(None)
    }

    fn evict_oldest(&mut self) {
        while let Some(oldest) = self.arrival_order.pop_front() {
            if self.groups.remove(&oldest).is_some() {
                tracing::debug!("evicting incomplete fragment group {}", oldest);
                return;
            }
        }
    }
}
