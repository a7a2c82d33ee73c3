//! Playback watchdog.
//!
//! Ends the session cleanly when the stream stops being useful: either no
//! real samples at all for `no_playback_timeout` (the sender went away, or
//! the latency monitor's under-run grace never resolved), or every window
//! of a sustained stretch contained drops (`choppy_playback_timeout`),
//! which sounds worse than a clean stop. Both cases return `Finish`, never
//! `Abort`: the stream did nothing wrong, it just ended or degraded.

use log::{debug, warn};

use super::frame::{frame_flags, Frame};
use super::sample_spec::{SampleSpec, MILLISECOND, SECOND};
use super::FrameReader;
use crate::status::Status;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Kill the session after this much playback with no real samples.
    /// Negative disables the check. Nanoseconds.
    pub no_playback_timeout: i64,
    /// Kill the session when drops persist this long. Negative disables.
    pub choppy_playback_timeout: i64,
    /// Window size for the choppy check. Nanoseconds.
    pub choppy_playback_window: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            no_playback_timeout: 2 * SECOND,
            choppy_playback_timeout: 2 * SECOND,
            choppy_playback_window: 300 * MILLISECOND,
        }
    }
}

pub struct Watchdog<R: FrameReader> {
    reader: R,

    /// Timeouts converted to samples per channel; 0 = disabled.
    no_playback_timeout: u64,
    choppy_timeout: u64,
    window_size: u64,

    /// Samples per channel read so far.
    stream_pos: u64,
    /// Position of the last frame carrying real samples.
    last_signal_pos: u64,
    /// Start of the current choppy window and whether it saw drops.
    window_start: u64,
    window_has_drops: bool,
    /// Consecutive droppy windows.
    droppy_windows: u64,

    alive: bool,
}

impl<R: FrameReader> Watchdog<R> {
    pub fn new(reader: R, config: &WatchdogConfig, spec: &SampleSpec) -> Self {
        let to_samples = |ns: i64| {
            if ns < 0 {
                0u64
            } else {
                spec.ns_2_samples(ns) as u64
            }
        };
        Self {
            reader,
            no_playback_timeout: to_samples(config.no_playback_timeout),
            choppy_timeout: to_samples(config.choppy_playback_timeout),
            window_size: to_samples(config.choppy_playback_window).max(1),
            stream_pos: 0,
            last_signal_pos: 0,
            window_start: 0,
            window_has_drops: false,
            droppy_windows: 0,
            alive: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    fn update(&mut self, frame: &Frame) -> bool {
        if frame.has_flags(frame_flags::NOT_BLANK) {
            self.last_signal_pos = self.stream_pos;
        }
        if frame.flags() & (frame_flags::INCOMPLETE | frame_flags::DROPS) != 0 {
            self.window_has_drops = true;
        }

        if self.no_playback_timeout != 0
            && self.stream_pos - self.last_signal_pos >= self.no_playback_timeout
        {
            warn!(
                "watchdog: no playback for {} samples, terminating session",
                self.stream_pos - self.last_signal_pos
            );
            return false;
        }

        // Close out complete windows.
        while self.stream_pos - self.window_start >= self.window_size {
            if self.window_has_drops {
                self.droppy_windows += 1;
            } else {
                self.droppy_windows = 0;
            }
            self.window_has_drops = false;
            self.window_start += self.window_size;

            if self.choppy_timeout != 0
                && self.droppy_windows * self.window_size >= self.choppy_timeout
            {
                warn!(
                    "watchdog: choppy playback for {} windows, terminating session",
                    self.droppy_windows
                );
                return false;
            }
        }

        true
    }
}

impl<R: FrameReader> FrameReader for Watchdog<R> {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        if !self.alive {
            return Err(Status::Finish);
        }

        self.reader.read(frame)?;
        self.stream_pos += frame.duration() as u64;

        if !self.update(frame) {
            self.alive = false;
            debug!("watchdog: session finished");
            return Err(Status::Finish);
        }
        Ok(())
    }
}
