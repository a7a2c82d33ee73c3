//! Scaling-driven resampler reader.
//!
//! Pulls raw frames from upstream and produces output at a rate scaled by
//! the factor the latency monitor publishes through `ScalingControl`. The
//! backend here is linear interpolation between adjacent input frames:
//! cheap, click-free under small scaling steps, and adequate for the
//! fractional-ppm corrections the control loop produces. Heavier backends
//! can replace `ResamplerReader` behind the same `FrameReader` seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::frame::Frame;
use super::sample_spec::SampleSpec;
use super::FrameReader;
use crate::status::{ConfigError, Status};

/// Scaling factors the linear backend accepts.
pub const MIN_SCALING: f64 = 0.25;
pub const MAX_SCALING: f64 = 4.0;

/// Input frames pulled per upstream read.
const CHUNK_FRAMES: u32 = 240;

/// Shared knob between the latency monitor and the resampler.
///
/// `set_scaling` validates against the backend range and publishes
/// atomically; the resampler picks the value up at its next read, so a
/// scaling change never tears mid-frame.
#[derive(Debug)]
pub struct ScalingControl {
    bits: AtomicU64,
}

impl ScalingControl {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    /// Returns false if `scaling` is outside the backend's range.
    pub fn set_scaling(&self, scaling: f64) -> bool {
        if !scaling.is_finite() || !(MIN_SCALING..=MAX_SCALING).contains(&scaling) {
            return false;
        }
        self.bits.store(scaling.to_bits(), Ordering::Relaxed);
        true
    }

    pub fn scaling(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for ScalingControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ResamplerReader<R: FrameReader> {
    reader: R,
    ctl: Arc<ScalingControl>,
    num_ch: usize,
    /// in_rate / out_rate, before scaling.
    rate_ratio: f64,

    in_frame: Frame,
    /// Next unconsumed input frame index within `in_frame`.
    in_pos: usize,
    in_valid: bool,

    /// Interpolation endpoints, one sample per channel.
    prev: Vec<f32>,
    curr: Vec<f32>,
    /// Fractional position between `prev` and `curr`.
    frac: f64,
    primed: bool,

    /// Flags collected from input frames since the last output frame.
    pending_flags: u32,
    /// Capture timestamp of the next output sample, when known.
    pending_cts: i64,
}

impl<R: FrameReader> ResamplerReader<R> {
    pub fn new(
        reader: R,
        ctl: Arc<ScalingControl>,
        in_spec: &SampleSpec,
        out_spec: &SampleSpec,
    ) -> Result<Self, ConfigError> {
        if in_spec.sample_rate() == 0 || out_spec.sample_rate() == 0 {
            return Err(ConfigError::RateMismatch {
                input: in_spec.sample_rate(),
                output: out_spec.sample_rate(),
            });
        }
        if in_spec.num_channels() != out_spec.num_channels() {
            return Err(ConfigError::ChannelMismatch {
                input: in_spec.num_channels(),
                output: out_spec.num_channels(),
            });
        }

        let num_ch = in_spec.num_channels();
        Ok(Self {
            reader,
            ctl,
            num_ch,
            rate_ratio: in_spec.sample_rate() as f64 / out_spec.sample_rate() as f64,
            in_frame: Frame::new_raw(CHUNK_FRAMES, num_ch),
            in_pos: 0,
            in_valid: false,
            prev: vec![0.0; num_ch],
            curr: vec![0.0; num_ch],
            frac: 0.0,
            primed: false,
            pending_flags: 0,
            pending_cts: 0,
        })
    }

    fn pull_chunk(&mut self) -> Result<(), Status> {
        self.in_frame.reset();
        self.reader.read(&mut self.in_frame)?;
        self.pending_flags |= self.in_frame.flags();
        self.pending_cts = self.in_frame.capture_timestamp();
        self.in_pos = 0;
        self.in_valid = true;
        Ok(())
    }

    /// Load the next input frame into `curr`, shifting `curr` into `prev`.
    fn advance_input(&mut self) -> Result<(), Status> {
        if !self.in_valid || self.in_pos >= CHUNK_FRAMES as usize {
            self.pull_chunk()?;
        }
        self.prev.copy_from_slice(&self.curr);
        let from = self.in_pos * self.num_ch;
        self.curr
            .copy_from_slice(&self.in_frame.samples()[from..from + self.num_ch]);
        self.in_pos += 1;
        Ok(())
    }

    fn prime(&mut self) -> Result<(), Status> {
        self.advance_input()?;
        self.prev.copy_from_slice(&self.curr);
        self.advance_input()?;
        self.frac = 0.0;
        self.primed = true;
        Ok(())
    }
}

impl<R: FrameReader> FrameReader for ResamplerReader<R> {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        frame.reset();

        if !self.primed {
            self.prime()?;
        }

        // One scaling sample per output frame keeps steps tiny and smooth.
        let step = self.ctl.scaling() * self.rate_ratio;
        let out_frames = frame.duration() as usize;
        let num_ch = self.num_ch;

        let first_cts = self.pending_cts;

        for n in 0..out_frames {
            let frac = self.frac as f32;
            let out = &mut frame.samples_mut()[n * num_ch..(n + 1) * num_ch];
            for ch in 0..num_ch {
                out[ch] = self.prev[ch] + frac * (self.curr[ch] - self.prev[ch]);
            }

            self.frac += step;
            while self.frac >= 1.0 {
                self.frac -= 1.0;
                self.advance_input()?;
            }
        }

        frame.add_flags(self.pending_flags);
        if first_cts != 0 {
            frame.set_capture_timestamp(first_cts);
        }
        self.pending_flags = 0;

        Ok(())
    }
}
