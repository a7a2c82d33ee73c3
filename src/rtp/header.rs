//! RTP packet parsing and composition.
//!
//! The 12-byte fixed header is followed by optional CSRCs, an optional
//! extension, payload, and optional padding whose length sits in the last
//! byte of the datagram. Only version 2 is accepted, and the header plus
//! padding must fit inside the datagram.

use log::debug;

use crate::audio::sample_spec::SampleSpec;
use crate::packet::{flags, Packet, PacketFactory, PacketPtr, RtpFields};
use crate::status::Status;

/// Fixed header length.
const HEADER_LEN: usize = 12;

/// Parses datagrams into packets, stamping payload duration when the
/// payload encoding is known.
pub struct RtpParser {
    payload_spec: Option<SampleSpec>,
    /// Mark parsed packets as repair-stream packets.
    repair: bool,
}

impl RtpParser {
    pub fn new(payload_spec: Option<SampleSpec>) -> Self {
        Self {
            payload_spec,
            repair: false,
        }
    }

    pub fn new_repair(payload_spec: Option<SampleSpec>) -> Self {
        Self {
            payload_spec,
            repair: true,
        }
    }

    /// Parse a datagram, copying it into a pooled buffer.
    /// `arrival` is the receipt time in nanoseconds (0 = unknown).
    pub fn parse(
        &self,
        factory: &PacketFactory,
        datagram: &[u8],
        arrival: i64,
    ) -> Result<PacketPtr, Status> {
        let Some((rtp, pkt_flags)) = self.parse_fields(datagram) else {
            return Err(Status::NoRoute);
        };
        let data = factory.buffer_from(datagram)?;
        Ok(Packet::new(data, pkt_flags, Some(rtp), None, arrival))
    }

    /// Parse wire fields without allocating; used by the FEC reader on
    /// repaired buffers it already owns.
    pub fn parse_fields(&self, data: &[u8]) -> Option<(RtpFields, u32)> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let first = data[0];
        let version = (first >> 6) & 0x03;
        if version != 2 {
            debug!("rtp parser: bad version {}", version);
            return None;
        }

        let padding = (first & 0x20) != 0;
        let extension = (first & 0x10) != 0;
        let csrc_count = (first & 0x0f) as usize;

        let second = data[1];
        let marker = (second & 0x80) != 0;
        let payload_type = second & 0x7f;

        let seqnum = u16::from_be_bytes([data[2], data[3]]);
        let stream_timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let source_id = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut header_len = HEADER_LEN + csrc_count * 4;
        if extension {
            if data.len() < header_len + 4 {
                return None;
            }
            let ext_words =
                u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]) as usize;
            header_len += 4 + ext_words * 4;
        }

        if header_len > data.len() {
            debug!("rtp parser: header exceeds datagram");
            return None;
        }

        let padding_len = if padding {
            let n = data[data.len() - 1] as usize;
            if n == 0 || n > data.len() - header_len {
                debug!("rtp parser: bad padding length {}", n);
                return None;
            }
            n
        } else {
            0
        };

        let payload = header_len..data.len() - padding_len;
        let duration = match &self.payload_spec {
            Some(spec) => spec.bytes_2_samples(payload.len()),
            None => 0,
        };

        let pkt_flags = if self.repair {
            flags::RTP | flags::REPAIR
        } else {
            flags::RTP | flags::AUDIO
        };

        Some((
            RtpFields {
                source_id,
                seqnum,
                stream_timestamp,
                marker,
                payload_type,
                duration,
                payload,
            },
            pkt_flags,
        ))
    }
}

/// Header fields supplied when composing a packet.
#[derive(Debug, Clone)]
pub struct RtpHeaderParams {
    pub source_id: u32,
    pub seqnum: u16,
    pub stream_timestamp: u32,
    pub marker: bool,
    pub payload_type: u8,
}

/// Produces RTP wire format into a prepared backing buffer.
pub struct RtpComposer;

impl RtpComposer {
    /// Write header + payload into `buf`. Returns the datagram length, or
    /// `None` if the buffer is too small.
    pub fn compose(buf: &mut [u8], params: &RtpHeaderParams, payload: &[u8]) -> Option<usize> {
        let total = HEADER_LEN + payload.len();
        if buf.len() < total {
            return None;
        }

        buf[0] = 2 << 6; // V=2, P=0, X=0, CC=0
        buf[1] = (params.payload_type & 0x7f) | if params.marker { 0x80 } else { 0 };
        buf[2..4].copy_from_slice(&params.seqnum.to_be_bytes());
        buf[4..8].copy_from_slice(&params.stream_timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&params.source_id.to_be_bytes());
        buf[HEADER_LEN..total].copy_from_slice(payload);

        Some(total)
    }

    /// Turn the trailing `n` payload bytes of a composed datagram into
    /// padding: sets the P bit and stamps the last byte with `n`.
    pub fn pad(datagram: &mut [u8], n: usize) -> bool {
        if n == 0 || n > 255 || datagram.len() < HEADER_LEN + n {
            return false;
        }
        datagram[0] |= 0x20;
        let last = datagram.len() - 1;
        datagram[last] = n as u8;
        true
    }
}
