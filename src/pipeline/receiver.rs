//! Receiver: datagrams in, one mixed frame stream out.
//!
//! The network thread feeds datagrams in through `receive_*`; parsing
//! happens there, then the packet is routed to its session by SSRC, with a
//! new session created on the first packet of an unknown SSRC. The device
//! thread pulls mixed audio with `read`: live sessions are summed into the
//! output frame and sessions whose read returns `Finish` are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use super::session::{ReceiverSession, SessionConfig};
use crate::audio::frame::Frame;
use crate::audio::pcm::PcmSubformat;
use crate::audio::FrameReader;
use crate::dbgio::{CsvConfig, CsvDumper};
use crate::fec::framing;
use crate::packet::{flags, Packet, PacketFactory};
use crate::rtp::RtpParser;
use crate::status::{ConfigError, Status};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub session: SessionConfig,
    /// Largest accepted datagram.
    pub max_packet_size: usize,
    /// Cap on simultaneous sessions.
    pub max_sessions: usize,
    /// Dump pipeline diagnostics to this CSV file when set.
    pub dump_file: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_packet_size: 2048,
            max_sessions: 16,
            dump_file: None,
        }
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    factory: Arc<PacketFactory>,
    parser: RtpParser,
    sessions: RwLock<HashMap<u32, Arc<ReceiverSession>>>,
    dumper: Option<CsvDumper>,
    /// Scratch frame for per-session reads during mixing.
    mix_frame: parking_lot::Mutex<Frame>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Result<Self, ConfigError> {
        if config.session.output_subformat != PcmSubformat::F32 {
            // The mixer sums raw samples; byte outputs only make sense for
            // single-session use through ReceiverSession directly.
            return Err(ConfigError::UnsupportedEncoding(
                "receiver output must be raw f32".into(),
            ));
        }

        let dumper = match &config.dump_file {
            Some(path) => Some(CsvDumper::start(CsvConfig {
                dump_file: path.clone(),
                ..CsvConfig::default()
            })?),
            None => None,
        };

        let num_ch = config.session.packet_spec.num_channels();
        Ok(Self {
            factory: Arc::new(PacketFactory::new(config.max_packet_size)),
            parser: RtpParser::new(Some(config.session.packet_spec)),
            sessions: RwLock::new(HashMap::new()),
            dumper,
            mix_frame: parking_lot::Mutex::new(Frame::new_raw(0, num_ch)),
            config,
        })
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session(&self, source_id: u32) -> Option<Arc<ReceiverSession>> {
        self.sessions.read().get(&source_id).cloned()
    }

    fn session_or_create(&self, source_id: u32) -> Result<Arc<ReceiverSession>, Status> {
        if let Some(session) = self.sessions.read().get(&source_id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write();
        // Raced with another packet of the same stream.
        if let Some(session) = sessions.get(&source_id) {
            return Ok(Arc::clone(session));
        }

        if sessions.len() >= self.config.max_sessions {
            warn!(
                "receiver: session limit {} reached, dropping ssrc {:#x}",
                self.config.max_sessions, source_id
            );
            return Err(Status::NoRoute);
        }

        info!("receiver: creating session for ssrc {:#x}", source_id);
        let session = Arc::new(
            ReceiverSession::new(
                &self.config.session,
                Arc::clone(&self.factory),
                self.dumper.as_ref().map(|d| d.producer()),
            )
            .map_err(|e| {
                warn!("receiver: can't create session: {}", e);
                Status::NoRoute
            })?,
        );
        sessions.insert(source_id, Arc::clone(&session));
        Ok(session)
    }

    /// Network-thread entry: a datagram from the source (audio) socket.
    /// `arrival` is the receipt time in nanoseconds.
    pub fn receive_source_datagram(&self, datagram: &[u8], arrival: i64) -> Result<(), Status> {
        let packet = match &self.config.session.fec {
            Some(fec) => {
                let Some(fec_fields) = framing::parse_source_packet(fec.scheme, datagram) else {
                    debug!("receiver: dropping malformed fec source datagram");
                    return Err(Status::NoRoute);
                };
                let Some((rtp, pkt_flags)) = self
                    .parser
                    .parse_fields(&datagram[fec_fields.payload.clone()])
                else {
                    debug!("receiver: dropping malformed rtp datagram");
                    return Err(Status::NoRoute);
                };
                let data = self.factory.buffer_from(datagram)?;
                Packet::new(
                    data,
                    pkt_flags | flags::FEC,
                    Some(rtp),
                    Some(fec_fields),
                    arrival,
                )
            }
            None => self.parser.parse(&self.factory, datagram, arrival)?,
        };

        let source_id = packet.rtp().map(|r| r.source_id).ok_or(Status::NoRoute)?;
        self.session_or_create(source_id)?.route_packet(packet)
    }

    /// Network-thread entry: a datagram from the repair socket.
    pub fn receive_repair_datagram(&self, datagram: &[u8], arrival: i64) -> Result<(), Status> {
        let Some(fec) = &self.config.session.fec else {
            debug!("receiver: repair datagram without fec config");
            return Err(Status::NoRoute);
        };

        let Some((source_id, fec_fields)) = framing::parse_repair_packet(fec.scheme, datagram)
        else {
            debug!("receiver: dropping malformed repair datagram");
            return Err(Status::NoRoute);
        };

        let data = self.factory.buffer_from(datagram)?;
        let packet = Packet::new(
            data,
            flags::FEC | flags::REPAIR,
            None,
            Some(fec_fields),
            arrival,
        );

        self.session_or_create(source_id)?.route_packet(packet)
    }

    /// Feed a stream-to-capture-time mapping point for one stream.
    pub fn update_clock_mapping(&self, source_id: u32, stream_ts: u32, capture_ns: i64) {
        if let Some(session) = self.session(source_id) {
            session.update_clock_mapping(stream_ts, capture_ns);
        }
    }

    /// Device-thread entry: report when the last read frame will play.
    pub fn reclock(&self, playback_timestamp: i64) {
        for session in self.sessions.read().values() {
            session.reclock(playback_timestamp);
        }
    }
}

impl FrameReader for Receiver {
    /// Mix all live sessions into `frame`. Sessions that finished are
    /// removed; with no sessions the frame is silence.
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        read_mixed(self, frame)
    }
}

/// Mixing body, shared so `&Receiver` callers (device callbacks holding an
/// `Arc`) can mix without exclusive access.
pub fn read_mixed(recv: &Receiver, frame: &mut Frame) -> Result<(), Status> {
    frame.reset();
    frame.samples_mut().fill(0.0);

    let sessions: Vec<(u32, Arc<ReceiverSession>)> = recv
        .sessions
        .read()
        .iter()
        .map(|(id, s)| (*id, Arc::clone(s)))
        .collect();

    let mut finished = Vec::new();
    let mut mix_frame = recv.mix_frame.lock();

    let num_ch = if frame.duration() > 0 {
        frame.num_samples() / frame.duration() as usize
    } else {
        1
    };
    if mix_frame.num_samples() != frame.num_samples() {
        *mix_frame = Frame::new_raw(frame.duration(), num_ch);
    }

    for (source_id, session) in &sessions {
        match session.read(&mut mix_frame) {
            Ok(()) => {
                for (out, s) in frame
                    .samples_mut()
                    .iter_mut()
                    .zip(mix_frame.samples().iter())
                {
                    *out = (*out + *s).clamp(-1.0, 1.0);
                }
                frame.add_flags(mix_frame.flags());
                if frame.capture_timestamp() == 0 {
                    frame.set_capture_timestamp(mix_frame.capture_timestamp());
                }
            }
            Err(Status::Finish) | Err(Status::Abort) => finished.push(*source_id),
            Err(_) => {}
        }
    }

    if !finished.is_empty() {
        let mut sessions = recv.sessions.write();
        for id in finished {
            info!("receiver: removing finished session {:#x}", id);
            sessions.remove(&id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::channels::ChannelSet;
    use crate::audio::frame::frame_flags;
    use crate::audio::latency_monitor::LatencyConfig;
    use crate::audio::pcm::encode_from_f32;
    use crate::audio::sample_spec::{SampleSpec, MILLISECOND};
    use crate::rtp::{RtpComposer, RtpHeaderParams};

    const SAMPLES_PER_PACKET: u32 = 480;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            session: SessionConfig {
                packet_spec: SampleSpec::new(48000, PcmSubformat::S16Be, ChannelSet::mono()),
                latency: LatencyConfig {
                    target_latency: 20 * MILLISECOND,
                    latency_tolerance: 500 * MILLISECOND,
                    ..LatencyConfig::default()
                },
                ..SessionConfig::default()
            },
            ..ReceiverConfig::default()
        }
    }

    fn datagram(ssrc: u32, sn: u16, value: f32) -> Vec<u8> {
        let samples = vec![value; SAMPLES_PER_PACKET as usize];
        let mut payload = vec![0u8; SAMPLES_PER_PACKET as usize * 2];
        encode_from_f32(PcmSubformat::S16Be, &samples, &mut payload);

        let mut buf = vec![0u8; 12 + payload.len()];
        let len = RtpComposer::compose(
            &mut buf,
            &RtpHeaderParams {
                source_id: ssrc,
                seqnum: sn,
                stream_timestamp: sn as u32 * SAMPLES_PER_PACKET,
                marker: false,
                payload_type: 96,
            },
            &payload,
        )
        .unwrap();
        buf.truncate(len);
        buf
    }

    #[test]
    fn test_session_created_per_ssrc() {
        let recv = Receiver::new(config()).unwrap();
        assert_eq!(recv.num_sessions(), 0);

        recv.receive_source_datagram(&datagram(0xa, 0, 0.1), 0).unwrap();
        assert_eq!(recv.num_sessions(), 1);

        recv.receive_source_datagram(&datagram(0xa, 1, 0.1), 0).unwrap();
        assert_eq!(recv.num_sessions(), 1);

        recv.receive_source_datagram(&datagram(0xb, 0, 0.1), 0).unwrap();
        assert_eq!(recv.num_sessions(), 2);
    }

    #[test]
    fn test_malformed_datagram_rejected() {
        let recv = Receiver::new(config()).unwrap();
        assert!(recv.receive_source_datagram(&[0u8; 4], 0).is_err());
        assert_eq!(recv.num_sessions(), 0);
    }

    #[test]
    fn test_mixes_two_sessions() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut recv = Receiver::new(config()).unwrap();

        for sn in 0..10u16 {
            recv.receive_source_datagram(&datagram(0xa, sn, 0.25), 0).unwrap();
            recv.receive_source_datagram(&datagram(0xb, sn, 0.25), 0).unwrap();
        }

        let mut frame = Frame::new_raw(480, 1);
        let mut saw_sum = false;
        for _ in 0..8 {
            recv.read(&mut frame).unwrap();
            if frame
                .samples()
                .iter()
                .any(|&s| (s - 0.5).abs() < 1e-2)
            {
                saw_sum = true;
                break;
            }
        }
        assert!(saw_sum, "mixed output should sum the two streams");
    }

    #[test]
    fn test_mix_clamps() {
        let mut recv = Receiver::new(config()).unwrap();

        for sn in 0..10u16 {
            recv.receive_source_datagram(&datagram(0xa, sn, 0.9), 0).unwrap();
            recv.receive_source_datagram(&datagram(0xb, sn, 0.9), 0).unwrap();
        }

        let mut frame = Frame::new_raw(480, 1);
        for _ in 0..8 {
            recv.read(&mut frame).unwrap();
            assert!(frame.samples().iter().all(|&s| s <= 1.0 && s >= -1.0));
        }
    }

    #[test]
    fn test_no_sessions_silence() {
        let mut recv = Receiver::new(config()).unwrap();
        let mut frame = Frame::new_raw(480, 1);
        recv.read(&mut frame).unwrap();
        assert!(frame.samples().iter().all(|&s| s == 0.0));
        assert!(!frame.has_flags(frame_flags::NOT_BLANK));
    }

    #[test]
    fn test_session_limit() {
        let mut cfg = config();
        cfg.max_sessions = 1;
        let recv = Receiver::new(cfg).unwrap();

        recv.receive_source_datagram(&datagram(0xa, 0, 0.1), 0).unwrap();
        let err = recv.receive_source_datagram(&datagram(0xb, 0, 0.1), 0);
        assert_eq!(err.unwrap_err(), Status::NoRoute);
        assert_eq!(recv.num_sessions(), 1);
    }

    #[test]
    fn test_non_raw_receiver_rejected() {
        let mut cfg = config();
        cfg.session.output_subformat = PcmSubformat::S16Be;
        assert!(Receiver::new(cfg).is_err());
    }
}
