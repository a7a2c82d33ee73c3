//! FEC block reader.
//!
//! Coordinates a source queue (payload-bearing packets) and a repair queue
//! (parity packets), grouping both by source block number. When a block has
//! at least one repair symbol and at least one missing source symbol, the
//! block decoder is asked to rebuild the losses; rebuilt buffers are parsed
//! back into RTP packets and delivered in symbol order alongside the
//! originals.
//!
//! Failure policy: a decoder that cannot rebuild a symbol is routine (the
//! gap is concealed downstream); a repaired packet whose SSRC does not
//! match the stream, or a block-number jump past the configured limit,
//! kills the session.

use std::sync::Arc;

use log::{debug, warn};

use super::decoder::BlockDecoder;
use crate::packet::sorted_queue::SortedQueue;
use crate::packet::{
    blknum_diff, blknum_le, blknum_lt, flags, Packet, PacketFactory, PacketPtr, PacketReader,
    PacketWriter, ReadMode,
};
use crate::rtp::RtpParser;
use crate::status::{ConfigError, Status};

#[derive(Debug, Clone)]
pub struct BlockReaderConfig {
    /// Largest accepted forward jump in source block numbers.
    pub max_sbn_jump: u16,
    /// Largest accepted total block length.
    pub max_block_length: usize,
}

impl Default for BlockReaderConfig {
    fn default() -> Self {
        Self {
            max_sbn_jump: 100,
            max_block_length: 256,
        }
    }
}

pub struct BlockReader<S: PacketReader, R: PacketReader> {
    decoder: Box<dyn BlockDecoder + Send>,
    source_reader: S,
    repair_reader: R,
    parser: RtpParser,
    factory: Arc<PacketFactory>,
    config: BlockReaderConfig,

    source_queue: SortedQueue,
    repair_queue: SortedQueue,
    source_block: Vec<Option<PacketPtr>>,
    repair_block: Vec<Option<PacketPtr>>,

    alive: bool,
    started: bool,
    can_repair: bool,
    /// Block geometry adopted from the first packet seen for the block.
    block_resized: bool,
    /// Symbol payload size for the current block.
    payload_size: usize,
    /// Next source symbol index to deliver.
    head_index: usize,
    cur_sbn: u16,
    has_source_id: bool,
    source_id: u32,
    n_packets: u64,
    peeked: Option<PacketPtr>,
}

impl<S: PacketReader, R: PacketReader> BlockReader<S, R> {
    /// `parser` is used to re-parse repaired buffers; it must carry the
    /// session payload spec so repaired packets get their duration stamped.
    pub fn new(
        decoder: Box<dyn BlockDecoder + Send>,
        source_reader: S,
        repair_reader: R,
        parser: RtpParser,
        factory: Arc<PacketFactory>,
        config: BlockReaderConfig,
    ) -> Self {
        Self {
            decoder,
            source_reader,
            repair_reader,
            parser,
            factory,
            config,
            source_queue: SortedQueue::new(0),
            repair_queue: SortedQueue::new(0),
            source_block: Vec::new(),
            repair_block: Vec::new(),
            alive: true,
            started: false,
            can_repair: false,
            block_resized: false,
            payload_size: 0,
            head_index: 0,
            cur_sbn: 0,
            has_source_id: false,
            source_id: 0,
            n_packets: 0,
            peeked: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Packets delivered so far, repaired ones included.
    pub fn num_packets(&self) -> u64 {
        self.n_packets
    }

    fn read_inner(&mut self) -> Result<PacketPtr, Status> {
        self.fetch_packets()?;

        if !self.started {
            let head = self.source_queue.head();
            if let Some(pp) = &head {
                let rtp = pp.rtp().ok_or(Status::Abort)?;
                let fec = pp.fec().ok_or(Status::Abort)?;
                if !self.has_source_id {
                    self.source_id = rtp.source_id;
                    self.has_source_id = true;
                }
                self.cur_sbn = fec.source_block_number;
                self.drop_repair_packets_from_prev_blocks();
            }

            match head {
                None => return self.source_queue.read(ReadMode::Fetch),
                Some(pp) if pp.fec().map_or(true, |f| f.encoding_symbol_id > 0) => {
                    // Not aligned to a block start yet; pass through.
                    return self.source_queue.read(ReadMode::Fetch);
                }
                Some(pp) => {
                    debug!(
                        "fec reader: got first packet in a block, start decoding: \
                         n_packets_before={} sn={} sbn={}",
                        self.n_packets,
                        pp.rtp().map_or(0, |r| r.seqnum),
                        self.cur_sbn
                    );
                    self.started = true;
                }
            }
        }

        self.get_next_packet()
    }

    fn get_next_packet(&mut self) -> Result<PacketPtr, Status> {
        self.update_packets();
        if !self.alive {
            return Err(Status::Abort);
        }

        let mut pp = self
            .source_block
            .get(self.head_index)
            .cloned()
            .flatten();

        loop {
            if pp.is_none() {
                self.try_repair();
                if !self.alive {
                    return Err(Status::Abort);
                }

                let mut pos = self.head_index;
                while pos < self.source_block.len() && self.source_block[pos].is_none() {
                    pos += 1;
                }

                if pos == self.source_block.len() {
                    if self.source_queue.is_empty() {
                        return Err(Status::Drain);
                    }
                } else {
                    pp = self.source_block[pos].clone();
                    pos += 1;
                }

                self.head_index = pos;
            } else {
                self.head_index += 1;
            }

            if self.head_index == self.source_block.len() {
                self.next_block();
                if !self.alive {
                    return Err(Status::Abort);
                }
            }

            if pp.is_some() {
                break;
            }
        }

        Ok(pp.expect("loop exits only with a packet"))
    }

    fn next_block(&mut self) {
        debug!("fec reader: next block: sbn={}", self.cur_sbn);

        self.source_block.iter_mut().for_each(|s| *s = None);
        self.repair_block.iter_mut().for_each(|s| *s = None);

        self.cur_sbn = self.cur_sbn.wrapping_add(1);
        self.head_index = 0;
        self.can_repair = false;
        self.block_resized = false;
        self.payload_size = 0;

        self.update_packets();
    }

    fn try_repair(&mut self) {
        if !self.can_repair || !self.block_resized {
            return;
        }

        let sbl = self.source_block.len();
        if self
            .decoder
            .begin_block(sbl, self.repair_block.len(), self.payload_size)
            .is_err()
        {
            return;
        }

        for (n, slot) in self.source_block.iter().enumerate() {
            if let Some(pp) = slot {
                self.decoder.set_symbol(n, pp.fec_payload());
            }
        }
        for (n, slot) in self.repair_block.iter().enumerate() {
            if let Some(pp) = slot {
                self.decoder.set_symbol(sbl + n, pp.fec_payload());
            }
        }

        for n in 0..sbl {
            if self.source_block[n].is_some() {
                continue;
            }

            let Some(repaired) = self.decoder.repair_symbol(n) else {
                continue;
            };

            let Some((rtp, pkt_flags)) = self.parser.parse_fields(repaired) else {
                debug!("fec reader: can't parse repaired packet");
                continue;
            };

            let Ok(data) = self.factory.buffer_from(repaired) else {
                warn!("fec reader: can't allocate repaired packet");
                continue;
            };

            if rtp.source_id != self.source_id {
                debug!(
                    "fec reader: repaired packet has bad source id, shutting down: \
                     got={:#x} expected={:#x}",
                    rtp.source_id, self.source_id
                );
                self.alive = false;
                break;
            }

            self.source_block[n] = Some(Packet::new(data, pkt_flags, Some(rtp), None, 0));
        }

        self.decoder.end_block();
        self.can_repair = false;
    }

    /// Adopt block geometry from the first packet seen for this block.
    fn resize_block(
        &mut self,
        sbl: usize,
        bl: usize,
        payload_size: usize,
    ) -> Result<(), ConfigError> {
        if sbl == 0 || bl < sbl || bl > self.config.max_block_length || payload_size == 0 {
            return Err(ConfigError::InvalidFecBlock { sbl, bl });
        }
        self.source_block.resize(sbl, None);
        self.repair_block.resize(bl - sbl, None);
        if self.head_index > sbl {
            self.head_index = sbl;
        }
        self.payload_size = payload_size;
        self.block_resized = true;
        Ok(())
    }

    /// Geometry consistency for packets after the first of a block.
    fn check_geometry(&self, sbl: usize, bl: usize, payload_size: usize) -> Result<(), ConfigError> {
        if sbl != self.source_block.len()
            || bl.saturating_sub(sbl) != self.repair_block.len()
            || payload_size != self.payload_size
        {
            return Err(ConfigError::InvalidFecBlock { sbl, bl });
        }
        Ok(())
    }

    fn fetch_packets(&mut self) -> Result<(), Status> {
        loop {
            if self.source_queue.len() > self.source_block.len().max(1) * 2 {
                break;
            }
            match self.source_reader.read(ReadMode::Fetch) {
                Ok(pp) => {
                    if pp.rtp().is_none() || pp.fec().is_none() {
                        debug!("fec reader: dropping non-fec source packet");
                        continue;
                    }
                    self.source_queue.write(pp)?;
                }
                Err(Status::Drain) => break,
                Err(e) => return Err(e),
            }
        }

        loop {
            if self.repair_queue.len() > self.repair_block.len().max(1) * 2 {
                break;
            }
            match self.repair_reader.read(ReadMode::Fetch) {
                Ok(pp) => {
                    if pp.fec().is_none() {
                        debug!("fec reader: dropping non-fec repair packet");
                        continue;
                    }
                    self.repair_queue.write(pp)?;
                }
                Err(Status::Drain) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn update_packets(&mut self) {
        self.update_source_packets();
        if self.alive {
            self.update_repair_packets();
        }
    }

    fn update_source_packets(&mut self) {
        let mut n_fetched = 0u32;
        let mut n_added = 0u32;
        let mut n_dropped = 0u32;

        loop {
            let Some(pp) = self.source_queue.head() else {
                break;
            };
            let fec = pp.fec().expect("queue holds only fec packets");
            let sbn = fec.source_block_number;

            if !blknum_le(sbn, self.cur_sbn) {
                if blknum_diff(sbn, self.cur_sbn) > self.config.max_sbn_jump as i32 {
                    warn!(
                        "fec reader: sbn jump too large, shutting down: \
                         cur_sbn={} pkt_sbn={} max_jump={}",
                        self.cur_sbn, sbn, self.config.max_sbn_jump
                    );
                    self.alive = false;
                }
                break;
            }

            let pp = self
                .source_queue
                .read(ReadMode::Fetch)
                .expect("head exists");
            n_fetched += 1;

            if blknum_lt(sbn, self.cur_sbn) {
                debug!(
                    "fec reader: dropping source packet from previous block: \
                     cur_sbn={} pkt_sbn={}",
                    self.cur_sbn, sbn
                );
                n_dropped += 1;
                continue;
            }

            let fec = pp.fec().expect("checked above").clone();
            let payload_len = pp.fec_payload().len();
            let geometry = if self.block_resized {
                self.check_geometry(
                    fec.source_block_length as usize,
                    fec.block_length as usize,
                    payload_len,
                )
            } else {
                self.resize_block(
                    fec.source_block_length as usize,
                    fec.block_length as usize,
                    payload_len,
                )
            };
            if let Err(e) = geometry {
                debug!("fec reader: dropping source packet: {}", e);
                n_dropped += 1;
                continue;
            }

            let p_num = fec.encoding_symbol_id as usize;
            if self.source_block[p_num].is_none() {
                self.can_repair = true;
                self.source_block[p_num] = Some(pp);
                n_added += 1;
            }
        }

        if n_dropped != 0 || n_fetched != n_added {
            debug!(
                "fec reader: source queue: fetched={} added={} dropped={}",
                n_fetched, n_added, n_dropped
            );
        }
    }

    fn update_repair_packets(&mut self) {
        let mut n_fetched = 0u32;
        let mut n_added = 0u32;
        let mut n_dropped = 0u32;

        loop {
            let Some(pp) = self.repair_queue.head() else {
                break;
            };
            let fec = pp.fec().expect("queue holds only fec packets");
            let sbn = fec.source_block_number;

            if !blknum_le(sbn, self.cur_sbn) {
                break;
            }

            let pp = self
                .repair_queue
                .read(ReadMode::Fetch)
                .expect("head exists");
            n_fetched += 1;

            if blknum_lt(sbn, self.cur_sbn) {
                debug!(
                    "fec reader: dropping repair packet from previous block: \
                     cur_sbn={} pkt_sbn={}",
                    self.cur_sbn, sbn
                );
                n_dropped += 1;
                continue;
            }

            let fec = pp.fec().expect("checked above").clone();
            let payload_len = pp.fec_payload().len();
            let geometry = if self.block_resized {
                self.check_geometry(
                    fec.source_block_length as usize,
                    fec.block_length as usize,
                    payload_len,
                )
            } else {
                self.resize_block(
                    fec.source_block_length as usize,
                    fec.block_length as usize,
                    payload_len,
                )
            };
            if let Err(e) = geometry {
                debug!("fec reader: dropping repair packet: {}", e);
                n_dropped += 1;
                continue;
            }

            let p_num = fec.encoding_symbol_id as usize - fec.source_block_length as usize;
            if self.repair_block[p_num].is_none() {
                self.can_repair = true;
                self.repair_block[p_num] = Some(pp);
                n_added += 1;
            }
        }

        if n_dropped != 0 || n_fetched != n_added {
            debug!(
                "fec reader: repair queue: fetched={} added={} dropped={}",
                n_fetched, n_added, n_dropped
            );
        }
    }

    /// Before decoding has started the current SBN may still move forward,
    /// so stale repair packets are discarded outright.
    fn drop_repair_packets_from_prev_blocks(&mut self) {
        let mut n_dropped = 0u32;

        loop {
            let Some(pp) = self.repair_queue.head() else {
                break;
            };
            let fec = pp.fec().expect("queue holds only fec packets");
            if !blknum_lt(fec.source_block_number, self.cur_sbn) {
                break;
            }
            let _ = self.repair_queue.read(ReadMode::Fetch);
            n_dropped += 1;
        }

        if n_dropped != 0 {
            debug!(
                "fec reader: dropped {} repair packets from previous blocks",
                n_dropped
            );
        }
    }
}

impl<S: PacketReader, R: PacketReader> PacketReader for BlockReader<S, R> {
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status> {
        if !self.alive {
            return Err(Status::Abort);
        }

        if let Some(pp) = &self.peeked {
            let pp = pp.clone();
            if mode == ReadMode::Fetch {
                self.peeked = None;
                self.n_packets += 1;
            }
            return Ok(pp);
        }

        let pp = self.read_inner()?;
        if !self.alive {
            return Err(Status::Abort);
        }

        match mode {
            ReadMode::Fetch => {
                self.n_packets += 1;
                Ok(pp)
            }
            ReadMode::Peek => {
                self.peeked = Some(pp.clone());
                Ok(pp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::channels::ChannelSet;
    use crate::audio::pcm::PcmSubformat;
    use crate::audio::sample_spec::SampleSpec;
    use crate::fec::decoder::{xor_parity, XorDecoder};
    use crate::fec::framing::{self, FecScheme};
    use crate::rtp::{RtpComposer, RtpHeaderParams};

    const SSRC: u32 = 0x1234_5678;
    const SBL: u16 = 10;
    const BL: u16 = 15;
    const SAMPLES_PER_PACKET: u32 = 10;

    fn spec() -> SampleSpec {
        SampleSpec::new(48000, PcmSubformat::S16Be, ChannelSet::stereo())
    }

    struct Harness {
        factory: Arc<PacketFactory>,
        source_q: SortedQueue,
        repair_q: SortedQueue,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                factory: Arc::new(PacketFactory::new(512)),
                source_q: SortedQueue::new(0),
                repair_q: SortedQueue::new(0),
            }
        }

        /// Wire-format source datagram for symbol `esi` of block `sbn`.
        fn source_datagram(&self, sbn: u16, esi: u16, ssrc: u32) -> Vec<u8> {
            let seqnum = sbn.wrapping_mul(SBL).wrapping_add(esi);
            let ts = seqnum as u32 * SAMPLES_PER_PACKET;
            // Payload bytes unique per symbol so repairs are checkable.
            let payload: Vec<u8> = (0..40u32)
                .map(|i| (seqnum as u32).wrapping_mul(131).wrapping_add(i) as u8)
                .collect();

            let mut buf = vec![0u8; 12 + payload.len()];
            let len = RtpComposer::compose(
                &mut buf,
                &RtpHeaderParams {
                    source_id: ssrc,
                    seqnum,
                    stream_timestamp: ts,
                    marker: false,
                    payload_type: 96,
                },
                &payload,
            )
            .unwrap();
            buf.truncate(len);

            let mut datagram = buf;
            framing::compose_source_footer(
                FecScheme::Rs8m,
                &crate::packet::FecFields {
                    source_block_number: sbn,
                    encoding_symbol_id: esi,
                    source_block_length: SBL,
                    block_length: BL,
                    payload: 0..0,
                },
                &mut datagram,
            );
            datagram
        }

        fn push_source(&mut self, sbn: u16, esi: u16) {
            self.push_source_with_ssrc(sbn, esi, SSRC);
        }

        fn push_source_with_ssrc(&mut self, sbn: u16, esi: u16, ssrc: u32) {
            let datagram = self.source_datagram(sbn, esi, ssrc);
            let fec = framing::parse_source_packet(FecScheme::Rs8m, &datagram).unwrap();
            let parser = RtpParser::new(Some(spec()));
            let (rtp, _) = parser
                .parse_fields(&datagram[fec.payload.clone()])
                .unwrap();
            let pp = Packet::new(
                self.factory.buffer_from(&datagram).unwrap(),
                flags::RTP | flags::AUDIO | flags::FEC,
                Some(rtp),
                Some(fec),
                0,
            );
            self.source_q.write(pp).unwrap();
        }

        /// Parity over the whole block, delivered as repair symbol `esi`.
        fn push_repair(&mut self, sbn: u16, esi: u16) {
            self.push_repair_with_block(sbn, esi, |_| SSRC);
        }

        fn push_repair_with_block(&mut self, sbn: u16, esi: u16, ssrc_of: impl Fn(u16) -> u32) {
            let protected: Vec<Vec<u8>> = (0..SBL)
                .map(|n| {
                    let d = self.source_datagram(sbn, n, ssrc_of(n));
                    let fec = framing::parse_source_packet(FecScheme::Rs8m, &d).unwrap();
                    d[fec.payload].to_vec()
                })
                .collect();
            let refs: Vec<&[u8]> = protected.iter().map(|p| p.as_slice()).collect();
            let parity = xor_parity(&refs);

            let datagram = framing::compose_repair_packet(
                FecScheme::Rs8m,
                SSRC,
                &crate::packet::FecFields {
                    source_block_number: sbn,
                    encoding_symbol_id: esi,
                    source_block_length: SBL,
                    block_length: BL,
                    payload: 0..0,
                },
                &parity,
            );
            let (_, fec) = framing::parse_repair_packet(FecScheme::Rs8m, &datagram).unwrap();
            let pp = Packet::new(
                self.factory.buffer_from(&datagram).unwrap(),
                flags::FEC | flags::REPAIR,
                None,
                Some(fec),
                0,
            );
            self.repair_q.write(pp).unwrap();
        }

        fn reader(self) -> BlockReader<SortedQueue, SortedQueue> {
            BlockReader::new(
                Box::new(XorDecoder::new()),
                self.source_q,
                self.repair_q,
                RtpParser::new(Some(spec())),
                self.factory,
                BlockReaderConfig::default(),
            )
        }
    }

    fn fetch_seqnums(reader: &mut impl PacketReader, max: usize) -> Vec<u16> {
        let mut out = Vec::new();
        for _ in 0..max {
            match reader.read(ReadMode::Fetch) {
                Ok(pp) => out.push(pp.rtp().unwrap().seqnum),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn test_no_losses_passthrough() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            h.push_source(0, esi);
        }
        let mut reader = h.reader();
        assert_eq!(
            fetch_seqnums(&mut reader, 20),
            (0..SBL).collect::<Vec<_>>()
        );
        assert!(reader.is_started());
    }

    #[test]
    fn test_repairs_missing_packet() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            if esi != 5 {
                h.push_source(0, esi);
            }
        }
        h.push_repair(0, SBL); // any one repair symbol

        let expected_payload = {
            let d = h.source_datagram(0, 5, SSRC);
            let fec = framing::parse_source_packet(FecScheme::Rs8m, &d).unwrap();
            let parser = RtpParser::new(Some(spec()));
            let (rtp, _) = parser.parse_fields(&d[fec.payload.clone()]).unwrap();
            d[fec.payload.start + rtp.payload.start..fec.payload.start + rtp.payload.end]
                .to_vec()
        };

        let mut reader = h.reader();
        let mut repaired_payload = None;
        let mut seqnums = Vec::new();
        for _ in 0..SBL {
            let pp = reader.read(ReadMode::Fetch).unwrap();
            let sn = pp.rtp().unwrap().seqnum;
            if sn == 5 {
                repaired_payload = Some(pp.payload().to_vec());
                assert_eq!(pp.rtp().unwrap().source_id, SSRC);
            }
            seqnums.push(sn);
        }

        assert_eq!(seqnums, (0..SBL).collect::<Vec<_>>());
        assert_eq!(repaired_payload.unwrap(), expected_payload);
        assert!(reader.is_alive());
    }

    #[test]
    fn test_double_loss_leaves_gap() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            if esi != 3 && esi != 7 {
                h.push_source(0, esi);
            }
        }
        h.push_repair(0, SBL);
        // Next block present so the reader can move past the damaged one.
        for esi in 0..SBL {
            h.push_source(1, esi);
        }

        let mut reader = h.reader();
        let seqnums = fetch_seqnums(&mut reader, 2 * SBL as usize);
        let expected: Vec<u16> = (0..2 * SBL).filter(|&sn| sn != 3 && sn != 7).collect();
        assert_eq!(seqnums, expected);
    }

    #[test]
    fn test_waits_for_block_start() {
        let mut h = Harness::new();
        // Stream begins mid-block: packets pass through unrepaired until
        // the first ESI=0 packet is seen.
        h.push_source(0, 7);
        h.push_source(0, 8);
        h.push_source(1, 0);
        h.push_source(1, 1);

        let mut reader = h.reader();
        let seqnums = fetch_seqnums(&mut reader, 10);
        assert_eq!(seqnums, vec![7, 8, 10, 11]);
        assert!(reader.is_started());
    }

    #[test]
    fn test_crosses_blocks_in_order() {
        let mut h = Harness::new();
        for sbn in 0..3u16 {
            for esi in 0..SBL {
                h.push_source(sbn, esi);
            }
        }
        let mut reader = h.reader();
        let seqnums = fetch_seqnums(&mut reader, 3 * SBL as usize + 5);
        assert_eq!(seqnums, (0..3 * SBL).collect::<Vec<_>>());
    }

    #[test]
    fn test_sbn_jump_kills_session() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            h.push_source(0, esi);
        }
        h.push_source(200, 0); // jump of 200 > max_sbn_jump 100

        let mut reader = h.reader();
        // Meeting the jump packet is fatal; reads up to that point may
        // still deliver packets from the current block.
        let mut aborted = false;
        for _ in 0..2 * SBL as usize {
            match reader.read(ReadMode::Fetch) {
                Ok(pp) => assert!(pp.rtp().unwrap().seqnum < SBL),
                Err(e) => {
                    assert_eq!(e, Status::Abort);
                    aborted = true;
                    break;
                }
            }
        }
        assert!(aborted);
        assert!(!reader.is_alive());
    }

    #[test]
    fn test_small_sbn_jump_tolerated() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            h.push_source(0, esi);
        }
        for esi in 0..SBL {
            h.push_source(3, esi); // jump of 3, within the limit
        }
        let mut reader = h.reader();
        let seqnums = fetch_seqnums(&mut reader, 3 * SBL as usize);
        assert_eq!(seqnums.len(), 2 * SBL as usize);
        assert!(reader.is_alive());
    }

    #[test]
    fn test_repaired_ssrc_mismatch_kills_session() {
        let mut h = Harness::new();
        // Block composed by a different sender: parity rebuilds a packet
        // whose SSRC differs from the session's.
        for esi in 0..SBL {
            if esi != 5 {
                h.push_source(0, esi);
            }
        }
        // Parity computed over a block whose ESI=5 symbol carries a foreign
        // SSRC, so the rebuilt packet identifies as a different stream.
        h.push_repair_with_block(0, SBL, |esi| if esi == 5 { 0x6666_6666 } else { SSRC });

        let mut reader = h.reader();
        let mut status = None;
        for _ in 0..SBL + 1 {
            match reader.read(ReadMode::Fetch) {
                Ok(_) => {}
                Err(e) => {
                    status = Some(e);
                    break;
                }
            }
        }
        assert_eq!(status, Some(Status::Abort));
        assert!(!reader.is_alive());
    }

    #[test]
    fn test_mismatched_geometry_dropped() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            if esi != 7 {
                h.push_source(0, esi);
            }
        }

        // A packet for the same block advertising a different geometry.
        let payload = vec![0u8; 40];
        let mut buf = vec![0u8; 12 + payload.len()];
        let len = RtpComposer::compose(
            &mut buf,
            &RtpHeaderParams {
                source_id: SSRC,
                seqnum: 100,
                stream_timestamp: 100 * SAMPLES_PER_PACKET,
                marker: false,
                payload_type: 96,
            },
            &payload,
        )
        .unwrap();
        buf.truncate(len);
        framing::compose_source_footer(
            FecScheme::Rs8m,
            &crate::packet::FecFields {
                source_block_number: 0,
                encoding_symbol_id: 7,
                source_block_length: SBL - 1,
                block_length: BL,
                payload: 0..0,
            },
            &mut buf,
        );
        let fec = framing::parse_source_packet(FecScheme::Rs8m, &buf).unwrap();
        let parser = RtpParser::new(Some(spec()));
        let (rtp, _) = parser.parse_fields(&buf[fec.payload.clone()]).unwrap();
        let pp = Packet::new(
            h.factory.buffer_from(&buf).unwrap(),
            flags::RTP | flags::AUDIO | flags::FEC,
            Some(rtp),
            Some(fec),
            0,
        );
        h.source_q.write(pp).unwrap();

        // The mismatched packet is dropped without killing the session;
        // the rest of the block comes through, with ESI 7 left as a loss.
        let mut reader = h.reader();
        let seqnums = fetch_seqnums(&mut reader, SBL as usize + 2);
        let expected: Vec<u16> = (0..SBL).filter(|&sn| sn != 7).collect();
        assert_eq!(seqnums, expected);
        assert!(reader.is_alive());
    }

    #[test]
    fn test_peek_then_fetch() {
        let mut h = Harness::new();
        for esi in 0..SBL {
            h.push_source(0, esi);
        }
        let mut reader = h.reader();
        assert_eq!(reader.read(ReadMode::Peek).unwrap().rtp().unwrap().seqnum, 0);
        assert_eq!(reader.read(ReadMode::Peek).unwrap().rtp().unwrap().seqnum, 0);
        assert_eq!(reader.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 0);
        assert_eq!(reader.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 1);
    }

    #[test]
    fn test_late_repair_for_old_block_dropped() {
        let mut h = Harness::new();
        h.push_repair(5, SBL); // repair for a block long gone
        for esi in 0..SBL {
            h.push_source(10, esi);
        }
        let mut reader = h.reader();
        let seqnums = fetch_seqnums(&mut reader, SBL as usize);
        assert_eq!(seqnums.len(), SBL as usize);
        assert!(reader.is_alive());
    }
}
