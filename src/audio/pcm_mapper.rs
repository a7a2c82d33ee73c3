//! PCM mappers: convert frames between in-memory sample encodings.
//!
//! The reader variant pulls frames from upstream in the input encoding,
//! maps them through the format-pair table, and fills the caller's frame
//! in the output encoding; the writer variant is the inverse, converting
//! frames pushed at it before forwarding downstream. Rates and channel
//! sets must match on both sides; only byte-aligned encodings are
//! accepted. Frame count in equals frame count out.

use super::frame::{frame_flags, Frame};
use super::pcm;
use super::sample_spec::SampleSpec;
use super::{FrameReader, FrameWriter};
use crate::status::{ConfigError, Status};

/// Scratch buffer size in frames per upstream pull.
const CHUNK_FRAMES: u32 = 240;

fn check_specs(in_spec: &SampleSpec, out_spec: &SampleSpec) -> Result<(), ConfigError> {
    if in_spec.sample_rate() != out_spec.sample_rate() {
        return Err(ConfigError::RateMismatch {
            input: in_spec.sample_rate(),
            output: out_spec.sample_rate(),
        });
    }
    if in_spec.channel_set() != out_spec.channel_set() {
        return Err(ConfigError::ChannelMismatch {
            input: in_spec.num_channels(),
            output: out_spec.num_channels(),
        });
    }
    if !in_spec.pcm_subformat().is_byte_aligned() || !out_spec.pcm_subformat().is_byte_aligned() {
        return Err(ConfigError::UnsupportedEncoding(format!(
            "bit-packed pcm not supported: in={} out={}",
            in_spec, out_spec
        )));
    }
    Ok(())
}

fn scratch_frame(spec: &SampleSpec, duration: u32) -> Frame {
    if spec.is_raw() {
        Frame::new_raw(duration, spec.num_channels())
    } else {
        Frame::with_byte_capacity(spec.samples_2_bytes(duration), duration)
    }
}

#[derive(Debug)]
pub struct PcmMapperReader<R: FrameReader> {
    reader: R,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    in_frame: Frame,
}

impl<R: FrameReader> PcmMapperReader<R> {
    pub fn new(
        reader: R,
        in_spec: SampleSpec,
        out_spec: SampleSpec,
    ) -> Result<Self, ConfigError> {
        check_specs(&in_spec, &out_spec)?;
        Ok(Self {
            reader,
            in_spec,
            out_spec,
            in_frame: scratch_frame(&in_spec, CHUNK_FRAMES),
        })
    }
}

impl<R: FrameReader> FrameReader for PcmMapperReader<R> {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        frame.reset();

        let duration = frame.duration();
        let num_ch = self.out_spec.num_channels();
        let in_fmt = self.in_spec.pcm_subformat();
        let out_fmt = self.out_spec.pcm_subformat();

        let mut out_flags = 0u32;
        let mut done: u32 = 0;
        while done < duration {
            let n = (duration - done).min(CHUNK_FRAMES);

            self.in_frame.reset();
            self.in_frame.set_duration(n);
            self.reader.read(&mut self.in_frame)?;

            let n_samples = n as usize * num_ch;
            let out_from = self.out_spec.samples_2_bytes(done);
            let out_to = out_from + self.out_spec.samples_2_bytes(n);
            pcm::map(
                in_fmt,
                self.in_frame.bytes(),
                out_fmt,
                &mut frame.bytes_mut()[out_from..out_to],
                n_samples,
            );

            out_flags |= self.in_frame.flags();
            if done == 0 {
                frame.set_capture_timestamp(self.in_frame.capture_timestamp());
            }
            done += n;
        }

        // The raw marker describes the output encoding, not the input.
        if self.out_spec.is_raw() {
            out_flags &= !frame_flags::NOT_RAW;
        } else {
            out_flags |= frame_flags::NOT_RAW;
        }
        frame.set_flags(out_flags);
        frame.set_duration(duration);

        Ok(())
    }
}

/// Push-side counterpart: converts frames written at it and forwards the
/// converted frame downstream.
pub struct PcmMapperWriter<W: FrameWriter> {
    writer: W,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    out_frame: Frame,
}

impl<W: FrameWriter> PcmMapperWriter<W> {
    pub fn new(
        writer: W,
        in_spec: SampleSpec,
        out_spec: SampleSpec,
    ) -> Result<Self, ConfigError> {
        check_specs(&in_spec, &out_spec)?;
        Ok(Self {
            writer,
            in_spec,
            out_spec,
            out_frame: scratch_frame(&out_spec, CHUNK_FRAMES),
        })
    }
}

impl<W: FrameWriter> FrameWriter for PcmMapperWriter<W> {
    fn write(&mut self, frame: &Frame) -> Result<(), Status> {
        let duration = frame.duration();
        let num_ch = self.in_spec.num_channels();
        let in_fmt = self.in_spec.pcm_subformat();
        let out_fmt = self.out_spec.pcm_subformat();

        let mut done: u32 = 0;
        while done < duration {
            let n = (duration - done).min(CHUNK_FRAMES);

            self.out_frame.reset();
            self.out_frame.set_duration(n);
            self.out_frame
                .set_byte_len(self.out_spec.samples_2_bytes(n));

            let in_from = self.in_spec.samples_2_bytes(done);
            let in_to = in_from + self.in_spec.samples_2_bytes(n);
            pcm::map(
                in_fmt,
                &frame.bytes()[in_from..in_to],
                out_fmt,
                self.out_frame.bytes_mut(),
                n as usize * num_ch,
            );

            let mut out_flags = frame.flags();
            if self.out_spec.is_raw() {
                out_flags &= !frame_flags::NOT_RAW;
            } else {
                out_flags |= frame_flags::NOT_RAW;
            }
            self.out_frame.set_flags(out_flags);
            let cts = frame.capture_timestamp();
            self.out_frame.set_capture_timestamp(if cts == 0 || done == 0 {
                cts
            } else {
                cts.saturating_add(self.in_spec.samples_2_ns(done))
            });

            self.writer.write(&self.out_frame)?;
            done += n;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::channels::ChannelSet;
    use crate::audio::pcm::PcmSubformat;

    fn spec(fmt: PcmSubformat) -> SampleSpec {
        SampleSpec::new(48000, fmt, ChannelSet::stereo())
    }

    /// Upstream producing s16be frames with a known sample pattern.
    #[derive(Debug)]
    struct S16Source {
        next: i16,
        cts: i64,
    }

    impl FrameReader for S16Source {
        fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
            let n_bytes = frame.duration() as usize * 2 * 2;
            for i in 0..n_bytes / 2 {
                let bytes = self.next.to_be_bytes();
                frame.bytes_mut()[i * 2] = bytes[0];
                frame.bytes_mut()[i * 2 + 1] = bytes[1];
                self.next = self.next.wrapping_add(1);
            }
            frame.add_flags(frame_flags::NOT_BLANK);
            frame.set_capture_timestamp(self.cts);
            Ok(())
        }
    }

    #[test]
    fn test_s16_to_raw() {
        let mut mapper = PcmMapperReader::new(
            S16Source { next: 0, cts: 777 },
            spec(PcmSubformat::S16Be),
            spec(PcmSubformat::F32),
        )
        .unwrap();

        let mut frame = Frame::new_raw(100, 2);
        mapper.read(&mut frame).unwrap();

        assert!(frame.is_raw());
        assert_eq!(frame.duration(), 100);
        assert_eq!(frame.capture_timestamp(), 777);
        assert!(frame.has_flags(frame_flags::NOT_BLANK));

        // Samples follow the source pattern scaled by 1/32768.
        let s = frame.samples();
        for (i, &v) in s.iter().enumerate().take(20) {
            let expected = i as f32 / 32768.0;
            assert!((v - expected).abs() < 1e-6, "sample {}: {}", i, v);
        }
    }

    #[test]
    fn test_spans_multiple_chunks() {
        // Duration above the scratch size forces several upstream pulls.
        let mut mapper = PcmMapperReader::new(
            S16Source { next: 0, cts: 0 },
            spec(PcmSubformat::S16Be),
            spec(PcmSubformat::F32),
        )
        .unwrap();

        let duration = CHUNK_FRAMES * 2 + 17;
        let mut frame = Frame::new_raw(duration, 2);
        mapper.read(&mut frame).unwrap();
        assert_eq!(frame.duration(), duration);

        let s = frame.samples();
        for (i, &v) in s.iter().enumerate() {
            let expected = (i as i64 % 32768) as f32 / 32768.0;
            assert!(
                (v - expected).abs() < 1e-6,
                "sample {}: {} vs {}",
                i,
                v,
                expected
            );
        }
    }

    /// Downstream sink collecting everything written at it, as raw bytes.
    struct CollectingWriter {
        bytes: Vec<u8>,
        frames: usize,
    }

    impl FrameWriter for CollectingWriter {
        fn write(&mut self, frame: &Frame) -> Result<(), Status> {
            self.bytes.extend_from_slice(frame.bytes());
            self.frames += 1;
            Ok(())
        }
    }

    #[test]
    fn test_writer_raw_to_s16() {
        let mut mapper = PcmMapperWriter::new(
            CollectingWriter {
                bytes: Vec::new(),
                frames: 0,
            },
            spec(PcmSubformat::F32),
            spec(PcmSubformat::S16Be),
        )
        .unwrap();

        let mut frame = Frame::new_raw(100, 2);
        for (i, s) in frame.samples_mut().iter_mut().enumerate() {
            *s = i as f32 / 32768.0;
        }
        mapper.write(&frame).unwrap();

        let out = &mapper.writer.bytes;
        assert_eq!(out.len(), 100 * 2 * 2);
        for i in 0..10 {
            let v = i16::from_be_bytes([out[i * 2], out[i * 2 + 1]]);
            // One LSB of quantization slack.
            assert!((v as i64 - i as i64).abs() <= 1, "sample {}: {}", i, v);
        }
    }

    #[test]
    fn test_writer_splits_large_frames() {
        let mut mapper = PcmMapperWriter::new(
            CollectingWriter {
                bytes: Vec::new(),
                frames: 0,
            },
            spec(PcmSubformat::F32),
            spec(PcmSubformat::S16Be),
        )
        .unwrap();

        let duration = CHUNK_FRAMES * 2 + 7;
        let frame = Frame::new_raw(duration, 2);
        mapper.write(&frame).unwrap();

        assert_eq!(mapper.writer.frames, 3);
        assert_eq!(
            mapper.writer.bytes.len(),
            duration as usize * 2 * 2
        );
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let out = SampleSpec::new(44100, PcmSubformat::F32, ChannelSet::stereo());
        let err = PcmMapperReader::new(
            S16Source { next: 0, cts: 0 },
            spec(PcmSubformat::S16Be),
            out,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::RateMismatch { .. }));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let out = SampleSpec::new(48000, PcmSubformat::F32, ChannelSet::mono());
        let err = PcmMapperReader::new(
            S16Source { next: 0, cts: 0 },
            spec(PcmSubformat::S16Be),
            out,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ChannelMismatch { .. }));
    }
}
