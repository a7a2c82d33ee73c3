//! Per-link packet statistics.
//!
//! A write-through stage between the router and a session queue. Tracks the
//! extended sequence range, loss and reorder counts, and RFC 3550
//! interarrival jitter. The snapshot feeds the session metrics; wire-level
//! RTCP reporting is outside the core.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::sample_spec::SampleSpec;
use crate::packet::{seqnum_diff, PacketPtr, PacketWriter};
use crate::status::Status;

/// Snapshot of link state.
#[derive(Debug, Default, Clone)]
pub struct LinkMetrics {
    /// Extended seqnum of the first packet seen.
    pub ext_first_seqnum: u64,
    /// Extended seqnum of the newest packet seen.
    pub ext_last_seqnum: u64,
    /// Packets that should have arrived given the seqnum range.
    pub expected_packets: u64,
    /// Packets actually observed (excluding duplicates).
    pub received_packets: u64,
    /// `expected - received`, floored at zero.
    pub lost_packets: u64,
    /// Packets that arrived behind a newer one.
    pub reordered_packets: u64,
    /// Smoothed interarrival jitter, nanoseconds.
    pub jitter: i64,
    /// Largest smoothed jitter observed, nanoseconds.
    pub peak_jitter: i64,
}

/// Cloneable read access to the meter's metrics.
#[derive(Clone)]
pub struct LinkMetricsHandle {
    shared: Arc<Mutex<LinkMetrics>>,
}

impl LinkMetricsHandle {
    pub fn get(&self) -> LinkMetrics {
        self.shared.lock().clone()
    }
}

struct MeterState {
    has_first: bool,
    ext_last: u64,
    prev_arrival: i64,
    prev_timestamp: u32,
    has_prev_timing: bool,
    /// Running jitter estimate in nanoseconds.
    jitter: f64,
}

pub struct LinkMeter<W: PacketWriter> {
    writer: W,
    sample_spec: SampleSpec,
    state: MeterState,
    metrics: Arc<Mutex<LinkMetrics>>,
}

impl<W: PacketWriter> LinkMeter<W> {
    pub fn new(writer: W, sample_spec: SampleSpec) -> Self {
        Self {
            writer,
            sample_spec,
            state: MeterState {
                has_first: false,
                ext_last: 0,
                prev_arrival: 0,
                prev_timestamp: 0,
                has_prev_timing: false,
                jitter: 0.0,
            },
            metrics: Arc::new(Mutex::new(LinkMetrics::default())),
        }
    }

    pub fn metrics_handle(&self) -> LinkMetricsHandle {
        LinkMetricsHandle {
            shared: Arc::clone(&self.metrics),
        }
    }

    fn update(&mut self, pp: &PacketPtr) {
        let Some(rtp) = pp.rtp() else {
            return;
        };

        let mut m = self.metrics.lock();
        m.received_packets += 1;

        if !self.state.has_first {
            self.state.has_first = true;
            self.state.ext_last = rtp.seqnum as u64;
            m.ext_first_seqnum = self.state.ext_last;
            m.ext_last_seqnum = self.state.ext_last;
        } else {
            let diff = seqnum_diff(rtp.seqnum, (self.state.ext_last & 0xffff) as u16) as i64;
            if diff > 0 {
                self.state.ext_last = self.state.ext_last.wrapping_add(diff as u64);
                m.ext_last_seqnum = self.state.ext_last;
            } else if diff < 0 {
                m.reordered_packets += 1;
            }
        }

        m.expected_packets = m.ext_last_seqnum - m.ext_first_seqnum + 1;
        m.lost_packets = m.expected_packets.saturating_sub(m.received_packets);

        // RFC 3550 interarrival jitter, in the receiver clock domain.
        if pp.arrival() != 0 {
            if self.state.has_prev_timing {
                let arrival_delta = pp.arrival() - self.state.prev_arrival;
                let ts_delta = self.sample_spec.stream_timestamp_delta_2_ns(
                    crate::packet::stream_timestamp_diff(
                        rtp.stream_timestamp,
                        self.state.prev_timestamp,
                    ),
                );
                let d = (arrival_delta - ts_delta).abs() as f64;
                self.state.jitter += (d - self.state.jitter) / 16.0;
                m.jitter = self.state.jitter as i64;
                m.peak_jitter = m.peak_jitter.max(m.jitter);
            }
            self.state.prev_arrival = pp.arrival();
            self.state.prev_timestamp = rtp.stream_timestamp;
            self.state.has_prev_timing = true;
        }
    }
}

impl<W: PacketWriter> PacketWriter for LinkMeter<W> {
    fn write(&mut self, packet: PacketPtr) -> Result<(), Status> {
        self.update(&packet);
        self.writer.write(packet)
    }
}
