//! Sample specification: rate, PCM subformat, channel set.
//!
//! All time/sample/byte conversions along the pipeline derive from this
//! triple. Timestamps crossing the component boundary are nanoseconds
//! (signed 64-bit); stream timestamps inside the pipeline are samples per
//! channel (unsigned 32-bit, wrap-around). Conversions saturate instead of
//! overflowing.
//!
//! The textual form is `<fmt>/<rate>/<channels>`, e.g. `s16be/48000/stereo`.

use std::fmt;
use std::str::FromStr;

use super::channels::ChannelSet;
use super::pcm::PcmSubformat;
use crate::status::ConfigError;

/// Nanoseconds per second.
pub const SECOND: i64 = 1_000_000_000;

/// Nanoseconds per millisecond.
pub const MILLISECOND: i64 = 1_000_000;

/// Sample format of a stream. PCM is the only family in the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Pcm(PcmSubformat),
}

/// Rate + format + channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    rate: u32,
    format: SampleFormat,
    channels: ChannelSet,
}

impl SampleSpec {
    pub fn new(rate: u32, subformat: PcmSubformat, channels: ChannelSet) -> Self {
        Self {
            rate,
            format: SampleFormat::Pcm(subformat),
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn pcm_subformat(&self) -> PcmSubformat {
        let SampleFormat::Pcm(sub) = self.format;
        sub
    }

    pub fn channel_set(&self) -> ChannelSet {
        self.channels
    }

    pub fn num_channels(&self) -> usize {
        self.channels.num_channels()
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.channels.is_valid()
    }

    /// True when samples are in-memory raw f32.
    pub fn is_raw(&self) -> bool {
        self.pcm_subformat().is_raw()
    }

    /// Nanoseconds covered by `n` samples per channel.
    pub fn samples_2_ns(&self, n: u32) -> i64 {
        debug_assert!(self.rate > 0);
        let ns = n as i128 * SECOND as i128 / self.rate as i128;
        ns.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Samples per channel covering `ns` nanoseconds, rounded to nearest.
    pub fn ns_2_samples(&self, ns: i64) -> u32 {
        if ns <= 0 {
            return 0;
        }
        let samples = (ns as i128 * self.rate as i128 + (SECOND / 2) as i128) / SECOND as i128;
        samples.clamp(0, u32::MAX as i128) as u32
    }

    /// Signed stream-timestamp delta covering `ns` nanoseconds.
    pub fn ns_2_stream_timestamp_delta(&self, ns: i64) -> i64 {
        let samples = (ns as i128 * self.rate as i128 + (SECOND / 2) as i128 * ns.signum() as i128)
            / SECOND as i128;
        samples.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Nanoseconds covered by a signed stream-timestamp delta.
    pub fn stream_timestamp_delta_2_ns(&self, delta: i64) -> i64 {
        debug_assert!(self.rate > 0);
        let ns = delta as i128 * SECOND as i128 / self.rate as i128;
        ns.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Overall samples (all channels) for `n` samples per channel.
    pub fn samples_overall(&self, n: u32) -> usize {
        n as usize * self.num_channels()
    }

    /// Payload bytes for `n` samples per channel.
    pub fn samples_2_bytes(&self, n: u32) -> usize {
        self.samples_overall(n) * self.pcm_subformat().bytes_per_sample()
    }

    /// Samples per channel contained in `bytes` of payload.
    pub fn bytes_2_samples(&self, bytes: usize) -> u32 {
        let per_frame = self.pcm_subformat().bytes_per_sample() * self.num_channels();
        if per_frame == 0 {
            return 0;
        }
        (bytes / per_frame).min(u32::MAX as usize) as u32
    }
}

impl FromStr for SampleSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::InvalidSampleSpec(s.to_string());

        let mut parts = s.split('/');
        let fmt = parts.next().ok_or_else(bad)?;
        let rate = parts.next().ok_or_else(bad)?;
        let chans = parts.next().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }

        let subformat = PcmSubformat::parse(fmt).ok_or_else(bad)?;
        let rate: u32 = rate.parse().map_err(|_| bad())?;
        if rate == 0 {
            return Err(bad());
        }
        let channels = ChannelSet::parse(chans).ok_or_else(bad)?;

        Ok(Self::new(rate, subformat, channels))
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.pcm_subformat().name(),
            self.rate,
            self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::channels::ChannelLayout;

    fn spec(s: &str) -> SampleSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_basic() {
        let s = spec("s16be/48000/stereo");
        assert_eq!(s.sample_rate(), 48000);
        assert_eq!(s.pcm_subformat(), PcmSubformat::S16Be);
        assert_eq!(s.num_channels(), 2);

        let s = spec("f32/44100/mono");
        assert!(s.is_raw());
        assert_eq!(s.num_channels(), 1);
    }

    #[test]
    fn test_parse_channel_forms() {
        assert_eq!(spec("s16/48000/surround5.1.2").num_channels(), 8);
        assert_eq!(spec("s16/48000/FL,FC,FR").num_channels(), 3);
        assert_eq!(spec("s16/48000/1,2,3").num_channels(), 3);
        assert_eq!(spec("s16/48000/1-8").num_channels(), 8);
        let s = spec("s16/48000/0xAC");
        assert_eq!(s.channel_set().layout(), ChannelLayout::Multitrack);
        assert_eq!(s.num_channels(), 4);
    }

    #[test]
    fn test_parse_rejects() {
        for bad in [
            "", "/", "//", "///", "/48000/stereo", "s16//stereo", "s16/48000/",
            "s16/48000/stereo/", "s16/0/stereo", "s16/-1/stereo", "s16/bad/stereo",
            "s77/48000/stereo", "s16/48000/nochannels",
        ] {
            assert!(bad.parse::<SampleSpec>().is_err(), "should reject {:?}", bad);
        }
    }

    #[test]
    fn test_format_roundtrip() {
        for s in [
            "s16be/48000/stereo",
            "f32/44100/surround5.1",
            "u8/8000/mono",
            "s24_3be/96000/0xAC",
            "s32be/48000/FL,FR,LFE",
        ] {
            let parsed = spec(s);
            let reparsed: SampleSpec = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed, "round-trip for {}", s);
        }
    }

    #[test]
    fn test_time_conversions() {
        let s = spec("f32/48000/stereo");
        assert_eq!(s.ns_2_samples(MILLISECOND), 48);
        assert_eq!(s.samples_2_ns(48), MILLISECOND);
        assert_eq!(s.ns_2_samples(0), 0);
        assert_eq!(s.ns_2_samples(-5), 0);

        // Round-trip within one sample of rounding.
        for n in [1u32, 7, 480, 48000, 12345] {
            let back = s.ns_2_samples(s.samples_2_ns(n));
            assert!((back as i64 - n as i64).abs() <= 1, "{} -> {}", n, back);
        }
    }

    #[test]
    fn test_signed_delta_conversions() {
        let s = spec("f32/48000/stereo");
        assert_eq!(s.ns_2_stream_timestamp_delta(MILLISECOND), 48);
        assert_eq!(s.ns_2_stream_timestamp_delta(-MILLISECOND), -48);
        assert_eq!(s.stream_timestamp_delta_2_ns(48), MILLISECOND);
        assert_eq!(s.stream_timestamp_delta_2_ns(-48), -MILLISECOND);
    }

    #[test]
    fn test_byte_conversions() {
        let s = spec("s16be/48000/stereo");
        assert_eq!(s.samples_2_bytes(10), 40); // 10 frames * 2ch * 2 bytes
        assert_eq!(s.bytes_2_samples(40), 10);
        assert_eq!(s.bytes_2_samples(41), 10); // trailing partial frame ignored

        let s = spec("s24_3be/48000/mono");
        assert_eq!(s.samples_2_bytes(10), 30);
        assert_eq!(s.bytes_2_samples(30), 10);
    }

    #[test]
    fn test_saturation() {
        let s = spec("f32/192000/mono");
        // Saturates instead of overflowing.
        assert_eq!(s.ns_2_samples(i64::MAX), u32::MAX);
        let _ = s.samples_2_ns(u32::MAX);
    }
}
