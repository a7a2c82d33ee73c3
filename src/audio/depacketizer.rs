//! Depacketizer: packets in, continuous PCM frame stream out.
//!
//! Every read produces exactly the requested duration. Samples covered by
//! packets are decoded; samples in gaps (lost packets, late packets, drained
//! upstream) are explicit zeros with the frame flagged `INCOMPLETE` (and
//! `DROPS` when a known gap was skipped). The stream position
//! `next_timestamp` advances strictly monotonically.
//!
//! The frame's capture timestamp is derived from the stream timestamp of
//! the first packet contributing to the frame, translated through the
//! session clock mapping when one is known.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::frame::{frame_flags, Frame};
use super::pcm::FrameDecoder;
use super::sample_spec::SampleSpec;
use super::FrameReader;
use crate::dbgio::{CsvEntry, CsvProducer};
use crate::packet::{
    stream_timestamp_diff, stream_timestamp_lt, PacketPtr, PacketReader, ReadMode,
};
use crate::status::Status;

/// Running totals, readable from any thread.
#[derive(Debug, Default, Clone)]
pub struct DepacketizerMetrics {
    /// Samples per channel decoded from packets.
    pub decoded_samples: u64,
    /// Samples per channel zero-filled for gaps and drains.
    pub missing_samples: u64,
    /// Packets discarded because playback had moved past them.
    pub late_packets: u64,
}

#[derive(Debug)]
struct Shared {
    started: AtomicBool,
    next_timestamp: AtomicU32,
    decoded_samples: AtomicU64,
    missing_samples: AtomicU64,
    late_packets: AtomicU64,
}

/// Read-only view of depacketizer state for the latency monitor.
#[derive(Clone, Debug)]
pub struct DepacketizerProbe {
    shared: Arc<Shared>,
}

impl DepacketizerProbe {
    /// True once the first packet has been consumed.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Relaxed)
    }

    /// Stream timestamp of the next sample to be produced.
    pub fn next_timestamp(&self) -> u32 {
        self.shared.next_timestamp.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> DepacketizerMetrics {
        DepacketizerMetrics {
            decoded_samples: self.shared.decoded_samples.load(Ordering::Relaxed),
            missing_samples: self.shared.missing_samples.load(Ordering::Relaxed),
            late_packets: self.shared.late_packets.load(Ordering::Relaxed),
        }
    }
}

/// Mapping point from stream timestamps to capture time, fed externally
/// (e.g. from sender reports). Cloneable; updates are visible to the
/// depacketizer on its next read.
#[derive(Clone, Default, Debug)]
pub struct ClockMapping {
    point: Arc<Mutex<Option<(u32, i64)>>>,
}

impl ClockMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that stream timestamp `stream_ts` was captured at `ns`.
    pub fn update(&self, stream_ts: u32, ns: i64) {
        *self.point.lock() = Some((stream_ts, ns));
    }

    /// Capture time of `stream_ts`, or 0 when no mapping is known.
    pub fn capture_ns(&self, stream_ts: u32, spec: &SampleSpec) -> i64 {
        match *self.point.lock() {
            Some((map_ts, map_ns)) => {
                let delta = stream_timestamp_diff(stream_ts, map_ts);
                map_ns.saturating_add(spec.stream_timestamp_delta_2_ns(delta))
            }
            None => 0,
        }
    }
}

pub struct Depacketizer<R: PacketReader> {
    reader: R,
    decoder: Box<dyn FrameDecoder>,
    spec: SampleSpec,
    mapping: ClockMapping,
    shared: Arc<Shared>,
    dumper: Option<CsvProducer>,

    /// Packet currently being consumed.
    cur: Option<PacketPtr>,
    next_timestamp: u32,
    started: bool,
}

impl<R: PacketReader> Depacketizer<R> {
    /// `spec` is the output spec: raw f32 at the packet rate and channels.
    pub fn new(
        reader: R,
        decoder: Box<dyn FrameDecoder>,
        spec: SampleSpec,
        mapping: ClockMapping,
        dumper: Option<CsvProducer>,
    ) -> Self {
        Self {
            reader,
            decoder,
            spec,
            mapping,
            shared: Arc::new(Shared {
                started: AtomicBool::new(false),
                next_timestamp: AtomicU32::new(0),
                decoded_samples: AtomicU64::new(0),
                missing_samples: AtomicU64::new(0),
                late_packets: AtomicU64::new(0),
            }),
            dumper,
            cur: None,
            next_timestamp: 0,
            started: false,
        }
    }

    pub fn probe(&self) -> DepacketizerProbe {
        DepacketizerProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn next_timestamp(&self) -> u32 {
        self.next_timestamp
    }

    fn fetch_packet(&mut self) -> Result<bool, Status> {
        match self.reader.read(ReadMode::Fetch) {
            Ok(pp) => {
                if !self.started {
                    self.next_timestamp = pp.begin();
                    self.started = true;
                    self.shared.started.store(true, Ordering::Relaxed);
                    debug!(
                        "depacketizer: got first packet: next_timestamp={}",
                        self.next_timestamp
                    );
                }
                self.cur = Some(pp);
                Ok(true)
            }
            Err(Status::Drain) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl<R: PacketReader> FrameReader for Depacketizer<R> {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        let num_ch = self.spec.num_channels();
        let duration = frame.duration();
        let total = duration as usize * num_ch;
        debug_assert!(frame.num_samples() >= total);

        frame.reset();

        let mut filled: u32 = 0;
        let mut decoded_total: u32 = 0;
        let mut missing_total: u32 = 0;
        let mut first_contrib: Option<u32> = None;

        while filled < duration {
            if self.cur.is_none() && !self.fetch_packet()? {
                break;
            }
            let pp = self.cur.clone().expect("fetched above");

            // Playback has moved past this packet entirely.
            if stream_timestamp_diff(pp.end(), self.next_timestamp) <= 0 {
                self.cur = None;
                self.shared.late_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if stream_timestamp_lt(self.next_timestamp, pp.begin()) {
                // Gap before the packet: zero-fill up to its start.
                let gap = stream_timestamp_diff(pp.begin(), self.next_timestamp) as u32;
                let n = gap.min(duration - filled);
                let from = filled as usize * num_ch;
                let to = (filled + n) as usize * num_ch;
                frame.samples_mut()[from..to].fill(0.0);
                frame.add_flags(frame_flags::INCOMPLETE | frame_flags::DROPS);
                missing_total += n;
                filled += n;
                self.next_timestamp = self.next_timestamp.wrapping_add(n);
                continue;
            }

            // Copy decoded samples from inside the packet window.
            let offset = stream_timestamp_diff(self.next_timestamp, pp.begin()) as u32;
            let avail = stream_timestamp_diff(pp.end(), self.next_timestamp) as u32;
            let n = avail.min(duration - filled);

            let from = filled as usize * num_ch;
            let to = (filled + n) as usize * num_ch;
            let got = self
                .decoder
                .decode(pp.payload(), offset, &mut frame.samples_mut()[from..to]);
            if got < n {
                // Payload shorter than its advertised duration.
                let from = (filled + got) as usize * num_ch;
                frame.samples_mut()[from..to].fill(0.0);
                frame.add_flags(frame_flags::INCOMPLETE);
                missing_total += n - got;
            }

            if first_contrib.is_none() {
                first_contrib = Some(self.next_timestamp);
            }
            decoded_total += got;
            filled += n;
            self.next_timestamp = self.next_timestamp.wrapping_add(n);

            if stream_timestamp_diff(pp.end(), self.next_timestamp) <= 0 {
                self.cur = None;
            }
        }

        if filled < duration {
            // Upstream drained: the rest is silence.
            let from = filled as usize * num_ch;
            frame.samples_mut()[from..total].fill(0.0);
            frame.add_flags(frame_flags::INCOMPLETE);
            missing_total += duration - filled;
            if self.started {
                self.next_timestamp = self.next_timestamp.wrapping_add(duration - filled);
            }
        }

        if decoded_total > 0 {
            frame.add_flags(frame_flags::NOT_BLANK);
        }
        if let Some(ts) = first_contrib {
            frame.set_capture_timestamp(self.mapping.capture_ns(ts, &self.spec));
        }

        self.shared
            .next_timestamp
            .store(self.next_timestamp, Ordering::Relaxed);
        self.shared
            .decoded_samples
            .fetch_add(decoded_total as u64, Ordering::Relaxed);
        self.shared
            .missing_samples
            .fetch_add(missing_total as u64, Ordering::Relaxed);

        if let Some(dumper) = &self.dumper {
            dumper.write(
                CsvEntry::new('d')
                    .push(self.next_timestamp as f64)
                    .push(decoded_total as f64)
                    .push(missing_total as f64),
            );
        }

        Ok(())
    }
}
