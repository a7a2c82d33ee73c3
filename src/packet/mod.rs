//! Packets, modular ordering, and the reader/writer seams of the packet
//! half of the pipeline.
//!
//! A packet is immutable once composed and shared by reference count
//! between queues, FEC blocks, and readers; the backing bytes live in a
//! slab-pool buffer that returns to its pool when the last reference drops.

pub mod delayed_reader;
pub mod router;
pub mod sorted_queue;

use std::ops::Range;
use std::sync::Arc;

use crate::core::slab_pool::{BufferPool, PooledBuffer};
use crate::status::Status;

/// Packet kind and lifecycle flags.
pub mod flags {
    /// Carries decodable audio payload.
    pub const AUDIO: u32 = 1 << 0;
    /// Carries FEC parity payload.
    pub const REPAIR: u32 = 1 << 1;
    /// Has parsed RTP fields.
    pub const RTP: u32 = 1 << 2;
    /// Has parsed FEC fields.
    pub const FEC: u32 = 1 << 3;
    /// Fully composed; immutable from here on.
    pub const PREPARED: u32 = 1 << 4;
}

/// Signed distance from `b` to `a` in 16-bit sequence-number space.
pub fn seqnum_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// `a < b` in modular sequence-number order.
pub fn seqnum_lt(a: u16, b: u16) -> bool {
    seqnum_diff(a, b) < 0
}

/// `a <= b` in modular sequence-number order.
pub fn seqnum_le(a: u16, b: u16) -> bool {
    seqnum_diff(a, b) <= 0
}

/// Signed distance from `b` to `a` in 32-bit stream-timestamp space.
pub fn stream_timestamp_diff(a: u32, b: u32) -> i64 {
    a.wrapping_sub(b) as i32 as i64
}

/// `a < b` in modular stream-timestamp order.
pub fn stream_timestamp_lt(a: u32, b: u32) -> bool {
    stream_timestamp_diff(a, b) < 0
}

/// `a <= b` in modular stream-timestamp order.
pub fn stream_timestamp_le(a: u32, b: u32) -> bool {
    stream_timestamp_diff(a, b) <= 0
}

/// Signed distance from `b` to `a` in 16-bit source-block-number space.
pub fn blknum_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// `a < b` in modular block-number order.
pub fn blknum_lt(a: u16, b: u16) -> bool {
    blknum_diff(a, b) < 0
}

/// `a <= b` in modular block-number order.
pub fn blknum_le(a: u16, b: u16) -> bool {
    blknum_diff(a, b) <= 0
}

/// Parsed RTP view of a packet.
#[derive(Debug, Clone)]
pub struct RtpFields {
    /// Stream identifier (SSRC).
    pub source_id: u32,
    /// Sequence number, wrap-around arithmetic.
    pub seqnum: u16,
    /// Sample-clock timestamp of the first sample, wrap-around arithmetic.
    pub stream_timestamp: u32,
    /// Marker bit, payload-defined meaning.
    pub marker: bool,
    /// Codec selector.
    pub payload_type: u8,
    /// Payload duration in samples per channel.
    pub duration: u32,
    /// Payload byte range within the packet data.
    pub payload: Range<usize>,
}

/// Parsed FEC view of a packet.
#[derive(Debug, Clone)]
pub struct FecFields {
    /// Source block this symbol belongs to.
    pub source_block_number: u16,
    /// Symbol index within the block.
    pub encoding_symbol_id: u16,
    /// Number of source symbols in the block.
    pub source_block_length: u16,
    /// Total symbols in the block (source + repair).
    pub block_length: u16,
    /// Protected bytes (source) or parity bytes (repair) within the data.
    pub payload: Range<usize>,
}

/// Reference-counted immutable packet.
pub type PacketPtr = Arc<Packet>;

/// A received or repaired packet.
pub struct Packet {
    flags: u32,
    rtp: Option<RtpFields>,
    fec: Option<FecFields>,
    /// Arrival time in nanoseconds, 0 when unknown (e.g. repaired packets).
    arrival: i64,
    data: PooledBuffer,
}

impl Packet {
    /// Compose a packet over its backing buffer.
    pub fn new(
        data: PooledBuffer,
        flags: u32,
        rtp: Option<RtpFields>,
        fec: Option<FecFields>,
        arrival: i64,
    ) -> PacketPtr {
        Arc::new(Self {
            flags: flags | flags::PREPARED,
            rtp,
            fec,
            arrival,
            data,
        })
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask == mask
    }

    pub fn rtp(&self) -> Option<&RtpFields> {
        self.rtp.as_ref()
    }

    pub fn fec(&self) -> Option<&FecFields> {
        self.fec.as_ref()
    }

    /// Arrival time in nanoseconds, 0 when unknown.
    pub fn arrival(&self) -> i64 {
        self.arrival
    }

    /// Whole datagram bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// RTP payload bytes; empty if the packet has no RTP view.
    pub fn payload(&self) -> &[u8] {
        match &self.rtp {
            Some(rtp) => &self.data[rtp.payload.clone()],
            None => &[],
        }
    }

    /// FEC symbol bytes; empty if the packet has no FEC view.
    pub fn fec_payload(&self) -> &[u8] {
        match &self.fec {
            Some(fec) => &self.data[fec.payload.clone()],
            None => &[],
        }
    }

    /// Stream timestamp of the first sample.
    pub fn begin(&self) -> u32 {
        self.rtp.as_ref().map_or(0, |r| r.stream_timestamp)
    }

    /// Stream timestamp one past the last sample.
    pub fn end(&self) -> u32 {
        self.rtp
            .as_ref()
            .map_or(0, |r| r.stream_timestamp.wrapping_add(r.duration))
    }

    /// Modular ordering used by the sorted queues: RTP packets order by
    /// sequence number, FEC-only packets by (block number, symbol id).
    pub fn compare(&self, other: &Packet) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;

        if let (Some(a), Some(b)) = (&self.rtp, &other.rtp) {
            return seqnum_diff(a.seqnum, b.seqnum).cmp(&0);
        }
        if let (Some(a), Some(b)) = (&self.fec, &other.fec) {
            let blk = blknum_diff(a.source_block_number, b.source_block_number);
            if blk != 0 {
                return blk.cmp(&0);
            }
            return a.encoding_symbol_id.cmp(&b.encoding_symbol_id);
        }
        Equal
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Packet");
        d.field("flags", &format_args!("{:#x}", self.flags));
        if let Some(rtp) = &self.rtp {
            d.field("sn", &rtp.seqnum).field("ts", &rtp.stream_timestamp);
        }
        if let Some(fec) = &self.fec {
            d.field("sbn", &fec.source_block_number)
                .field("esi", &fec.encoding_symbol_id);
        }
        d.finish()
    }
}

/// Whether a read consumes the packet or just looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Return the next packet without removing it.
    Peek,
    /// Return and remove the next packet.
    Fetch,
}

/// Pull seam between packet pipeline stages.
pub trait PacketReader {
    /// Read the next packet, or `Err(Status::Drain)` when none is
    /// available right now.
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status>;
}

impl PacketReader for Box<dyn PacketReader + Send> {
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status> {
        (**self).read(mode)
    }
}

/// Push seam between packet pipeline stages.
pub trait PacketWriter {
    fn write(&mut self, packet: PacketPtr) -> Result<(), Status>;
}

impl PacketWriter for Box<dyn PacketWriter + Send> {
    fn write(&mut self, packet: PacketPtr) -> Result<(), Status> {
        (**self).write(packet)
    }
}

/// Allocates packet buffers from a shared slab pool.
pub struct PacketFactory {
    buffers: BufferPool,
}

impl PacketFactory {
    /// Create a factory serving buffers of `max_packet_size` bytes.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buffers: BufferPool::new("packet buffers", max_packet_size),
        }
    }

    /// Largest datagram a buffer can hold.
    pub fn max_packet_size(&self) -> usize {
        self.buffers.buffer_size()
    }

    /// Acquire an empty buffer sized to `len`.
    pub fn new_buffer(&self, len: usize) -> Result<PooledBuffer, Status> {
        if len > self.buffers.buffer_size() {
            return Err(Status::NoMem);
        }
        let mut buf = self.buffers.acquire().ok_or(Status::NoMem)?;
        buf.resize_to(len);
        Ok(buf)
    }

    /// Acquire a buffer holding a copy of `bytes`.
    pub fn buffer_from(&self, bytes: &[u8]) -> Result<PooledBuffer, Status> {
        let mut buf = self.new_buffer(bytes.len())?;
        buf.copy_from_slice(bytes);
        Ok(buf)
    }
}
