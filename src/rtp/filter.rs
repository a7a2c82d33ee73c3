//! Per-session packet validation.
//!
//! Sits between the incoming queue and the rest of the packet chain.
//! Packets that do not parse as RTP, switch SSRC mid-stream, carry an
//! unexpected payload type, or have no duration are dropped here, before
//! they can confuse the FEC reader or the depacketizer.

use log::debug;

use crate::packet::{PacketPtr, PacketReader, ReadMode};
use crate::status::Status;

pub struct RtpFilter<R: PacketReader> {
    reader: R,
    payload_type: u8,
    source_id: Option<u32>,
    n_dropped: u64,
}

impl<R: PacketReader> RtpFilter<R> {
    pub fn new(reader: R, payload_type: u8) -> Self {
        Self {
            reader,
            payload_type,
            source_id: None,
            n_dropped: 0,
        }
    }

    /// Packets dropped so far.
    pub fn num_dropped(&self) -> u64 {
        self.n_dropped
    }

    fn accept(&mut self, pp: &PacketPtr) -> bool {
        let Some(rtp) = pp.rtp() else {
            debug!("rtp filter: dropping non-rtp packet");
            return false;
        };

        if rtp.payload_type != self.payload_type {
            debug!(
                "rtp filter: dropping packet with payload type {} (expected {})",
                rtp.payload_type, self.payload_type
            );
            return false;
        }

        if rtp.duration == 0 {
            debug!("rtp filter: dropping packet with empty payload");
            return false;
        }

        match self.source_id {
            None => {
                self.source_id = Some(rtp.source_id);
                true
            }
            Some(id) if id == rtp.source_id => true,
            Some(id) => {
                debug!(
                    "rtp filter: dropping packet with source id {:#x} (expected {:#x})",
                    rtp.source_id, id
                );
                false
            }
        }
    }
}

impl<R: PacketReader> PacketReader for RtpFilter<R> {
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status> {
        loop {
            let pp = self.reader.read(mode)?;
            if self.accept(&pp) {
                return Ok(pp);
            }
            self.n_dropped += 1;
            if mode == ReadMode::Peek {
                // Consume the rejected packet so the peek can move on.
                let _ = self.reader.read(ReadMode::Fetch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::sorted_queue::SortedQueue;
    use crate::packet::{flags, Packet, PacketFactory, PacketWriter, RtpFields};

    fn make_packet(
        factory: &PacketFactory,
        sn: u16,
        ssrc: u32,
        pt: u8,
        duration: u32,
    ) -> PacketPtr {
        Packet::new(
            factory.buffer_from(&[0u8; 8]).unwrap(),
            flags::RTP | flags::AUDIO,
            Some(RtpFields {
                source_id: ssrc,
                seqnum: sn,
                stream_timestamp: sn as u32 * 8,
                marker: false,
                payload_type: pt,
                duration,
                payload: 0..8,
            }),
            None,
            0,
        )
    }

    #[test]
    fn test_passes_valid() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        q.write(make_packet(&factory, 1, 0xa, 96, 8)).unwrap();

        let mut filter = RtpFilter::new(q, 96);
        assert_eq!(filter.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 1);
        assert_eq!(filter.num_dropped(), 0);
    }

    #[test]
    fn test_drops_ssrc_switch() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        q.write(make_packet(&factory, 1, 0xa, 96, 8)).unwrap();
        q.write(make_packet(&factory, 2, 0xb, 96, 8)).unwrap();
        q.write(make_packet(&factory, 3, 0xa, 96, 8)).unwrap();

        let mut filter = RtpFilter::new(q, 96);
        assert_eq!(filter.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 1);
        // The foreign-SSRC packet is skipped transparently.
        assert_eq!(filter.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 3);
        assert_eq!(filter.num_dropped(), 1);
    }

    #[test]
    fn test_drops_wrong_payload_type() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        q.write(make_packet(&factory, 1, 0xa, 97, 8)).unwrap();

        let mut filter = RtpFilter::new(q, 96);
        assert_eq!(filter.read(ReadMode::Fetch).unwrap_err(), Status::Drain);
        assert_eq!(filter.num_dropped(), 1);
    }

    #[test]
    fn test_peek_skips_invalid() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        q.write(make_packet(&factory, 1, 0xa, 96, 0)).unwrap(); // empty payload
        q.write(make_packet(&factory, 2, 0xa, 96, 8)).unwrap();

        let mut filter = RtpFilter::new(q, 96);
        let pp = filter.read(ReadMode::Peek).unwrap();
        assert_eq!(pp.rtp().unwrap().seqnum, 2);
        // Peek did not consume the valid packet.
        let pp = filter.read(ReadMode::Fetch).unwrap();
        assert_eq!(pp.rtp().unwrap().seqnum, 2);
    }
}
