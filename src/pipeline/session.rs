//! Per-sender receiver session.
//!
//! Assembles the pull chain for one SSRC:
//!
//! ```text
//! device <- [mapper] <- [resampler] <- latency monitor <- watchdog
//!        <- depacketizer <- delayed reader <- [fec reader] <- filter
//!        <- source queue <- link meter <- router <- network
//!                           repair queue <------/
//! ```
//!
//! The network thread enters through `route_packet`; the device thread
//! through `read`. The two meet only at the shared queues, each guarded by
//! its own lock held for a single enqueue or dequeue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::audio::channels::ChannelSet;
use crate::audio::depacketizer::{ClockMapping, Depacketizer, DepacketizerMetrics, DepacketizerProbe};
use crate::audio::frame::Frame;
use crate::audio::latency_monitor::{LatencyConfig, LatencyHandle, LatencyMetrics, LatencyMonitor};
use crate::audio::pcm::{PcmDecoder, PcmSubformat};
use crate::audio::pcm_mapper::PcmMapperReader;
use crate::audio::resampler::{ResamplerReader, ScalingControl};
use crate::audio::sample_spec::SampleSpec;
use crate::audio::watchdog::{Watchdog, WatchdogConfig};
use crate::audio::FrameReader;
use crate::dbgio::CsvProducer;
use crate::fec::{BlockReader, BlockReaderConfig, FecScheme, XorDecoder};
use crate::packet::delayed_reader::DelayedReader;
use crate::packet::router::Router;
use crate::packet::sorted_queue::SharedQueue;
use crate::packet::{flags, PacketFactory, PacketPtr, PacketReader, PacketWriter};
use crate::rtp::{LinkMeter, LinkMetrics, LinkMetricsHandle, RtpFilter, RtpParser};
use crate::status::{ConfigError, Status};

/// FEC binding for a session.
#[derive(Debug, Clone)]
pub struct FecConfig {
    pub scheme: FecScheme,
    pub reader: BlockReaderConfig,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Expected RTP payload type.
    pub payload_type: u8,
    /// Wire encoding of packet payloads, e.g. `s16be/48000/stereo`.
    pub packet_spec: SampleSpec,
    /// Device-side rate; channels must match the packet spec.
    pub output_rate: u32,
    /// Device-side sample encoding; raw f32 unless a byte sink wants
    /// something else.
    pub output_subformat: PcmSubformat,
    pub latency: LatencyConfig,
    pub watchdog: WatchdogConfig,
    pub fec: Option<FecConfig>,
    /// Cap on each incoming queue, 0 = unlimited.
    pub queue_max_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            payload_type: 96,
            packet_spec: SampleSpec::new(48000, PcmSubformat::S16Be, ChannelSet::stereo()),
            output_rate: 48000,
            output_subformat: PcmSubformat::F32,
            latency: LatencyConfig::default(),
            watchdog: WatchdogConfig::default(),
            fec: None,
            queue_max_size: 0,
        }
    }
}

/// Snapshot of one session's health.
#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    pub link: LinkMetrics,
    pub latency: LatencyMetrics,
    pub depacketizer: DepacketizerMetrics,
}

pub struct ReceiverSession {
    router: Mutex<Router>,
    chain: Mutex<Box<dyn FrameReader + Send>>,
    latency: LatencyHandle,
    link: LinkMetricsHandle,
    depacketizer: DepacketizerProbe,
    mapping: ClockMapping,
    output_spec: SampleSpec,
    alive: AtomicBool,
}

impl ReceiverSession {
    pub fn new(
        config: &SessionConfig,
        factory: Arc<PacketFactory>,
        dumper: Option<CsvProducer>,
    ) -> Result<Self, ConfigError> {
        let packet_spec = config.packet_spec;
        if !packet_spec.is_valid() {
            return Err(ConfigError::InvalidSampleSpec(packet_spec.to_string()));
        }

        // Raw spec at the packet rate; what the depacketizer emits.
        let mid_spec = SampleSpec::new(
            packet_spec.sample_rate(),
            PcmSubformat::F32,
            packet_spec.channel_set(),
        );
        // Raw spec at the output rate; what the resampler emits.
        let out_raw_spec = SampleSpec::new(
            config.output_rate,
            PcmSubformat::F32,
            packet_spec.channel_set(),
        );
        let device_spec = SampleSpec::new(
            config.output_rate,
            config.output_subformat,
            packet_spec.channel_set(),
        );

        // Incoming side: router -> link meter -> shared queues.
        let source_queue = SharedQueue::new(config.queue_max_size);
        let repair_queue = SharedQueue::new(config.queue_max_size);

        let source_meter = LinkMeter::new(source_queue.clone(), packet_spec);
        let link = source_meter.metrics_handle();

        let mut router = Router::new();
        router.add_route(Box::new(source_meter), flags::AUDIO);
        if config.fec.is_some() {
            router.add_route(Box::new(repair_queue.clone()), flags::REPAIR);
        }

        // Outgoing side: queues -> packet readers -> frame readers.
        let filter = RtpFilter::new(source_queue.clone(), config.payload_type);

        let pkt_reader: Box<dyn PacketReader + Send> = match &config.fec {
            Some(fec) => Box::new(BlockReader::new(
                Box::new(XorDecoder::new()),
                filter,
                repair_queue.clone(),
                RtpParser::new(Some(packet_spec)),
                Arc::clone(&factory),
                fec.reader.clone(),
            )),
            None => Box::new(filter),
        };

        let delay = mid_spec.ns_2_samples(config.latency.target_latency);
        let delayed = DelayedReader::new(pkt_reader, delay);

        let mapping = ClockMapping::new();
        let depacketizer = Depacketizer::new(
            delayed,
            Box::new(PcmDecoder::new(&packet_spec)),
            mid_spec,
            mapping.clone(),
            dumper.clone(),
        );
        let probe = depacketizer.probe();

        let watchdog = Watchdog::new(depacketizer, &config.watchdog, &mid_spec);

        let need_resampler =
            config.latency.fe_enable || packet_spec.sample_rate() != config.output_rate;
        let scaling = need_resampler.then(|| Arc::new(ScalingControl::new()));

        let monitor = LatencyMonitor::new(
            watchdog,
            source_queue.clone(),
            probe.clone(),
            scaling.clone(),
            &config.latency,
            mid_spec,
            dumper,
        )?;
        let latency = monitor.handle();

        let mut chain: Box<dyn FrameReader + Send> = Box::new(monitor);
        if let Some(ctl) = scaling {
            chain = Box::new(ResamplerReader::new(chain, ctl, &mid_spec, &out_raw_spec)?);
        }
        if !config.output_subformat.is_raw() {
            chain = Box::new(PcmMapperReader::new(chain, out_raw_spec, device_spec)?);
        }

        debug!(
            "session: created: pt={} packet_spec={} output={}",
            config.payload_type, packet_spec, device_spec
        );

        Ok(Self {
            router: Mutex::new(router),
            chain: Mutex::new(chain),
            latency,
            link,
            depacketizer: probe,
            mapping,
            output_spec: device_spec,
            alive: AtomicBool::new(true),
        })
    }

    /// Spec of the frames `read` produces.
    pub fn output_spec(&self) -> SampleSpec {
        self.output_spec
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Feed a mapping point from stream timestamps to sender capture time
    /// (e.g. from a sender report).
    pub fn update_clock_mapping(&self, stream_ts: u32, capture_ns: i64) {
        self.mapping.update(stream_ts, capture_ns);
    }

    /// Network-thread entry: hand a parsed packet to the session.
    pub fn route_packet(&self, packet: PacketPtr) -> Result<(), Status> {
        if !self.is_alive() {
            return Err(Status::NoRoute);
        }
        self.router.lock().write(packet)
    }

    /// Device-thread entry: pull one frame through the whole chain.
    /// Fatal conditions mark the session dead and surface as `Finish` so
    /// the mixer drops it; the cause is visible in the logs.
    pub fn read(&self, frame: &mut Frame) -> Result<(), Status> {
        if !self.is_alive() {
            return Err(Status::Finish);
        }

        match self.chain.lock().read(frame) {
            Ok(()) => Ok(()),
            Err(Status::Drain) => Ok(()),
            Err(e) => {
                debug!("session: read failed ({}), finishing session", e);
                self.alive.store(false, Ordering::Relaxed);
                Err(Status::Finish)
            }
        }
    }

    /// Device-thread entry: report the audible play-out time of the last
    /// frame.
    pub fn reclock(&self, playback_timestamp: i64) -> bool {
        self.latency.reclock(playback_timestamp)
    }

    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            link: self.link.get(),
            latency: self.latency.metrics(),
            depacketizer: self.depacketizer.metrics(),
        }
    }
}
