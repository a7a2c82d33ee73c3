//! Audio frames: the unit of transfer along the frame reader chain.
//!
//! A frame is a mutable buffer of interleaved samples plus metadata. It has
//! a single owner along the pull chain; readers fill it in place. The
//! backing store is f32-aligned so raw frames expose `&[f32]` directly,
//! while mapper stages can view the same storage as bytes for non-raw
//! content.

/// Frame state flags.
pub mod frame_flags {
    /// Samples are not in-memory raw f32.
    pub const NOT_RAW: u32 = 1 << 0;
    /// Some samples could not be sourced and are explicit zeros.
    pub const INCOMPLETE: u32 = 1 << 1;
    /// Packets or samples were dropped to produce this frame.
    pub const DROPS: u32 = 1 << 2;
    /// At least one sample came from actual payload, not gap fill.
    pub const NOT_BLANK: u32 = 1 << 3;
}

/// A buffer of interleaved samples plus metadata.
#[derive(Debug)]
pub struct Frame {
    data: Vec<f32>,
    byte_len: usize,
    /// Requested length in samples per channel.
    duration: u32,
    flags: u32,
    /// Capture time of the first sample, nanoseconds; 0 when unknown.
    capture_timestamp: i64,
}

impl Frame {
    /// A raw f32 frame of `duration` samples per channel.
    pub fn new_raw(duration: u32, num_channels: usize) -> Self {
        let n = duration as usize * num_channels;
        Self {
            data: vec![0.0; n],
            byte_len: n * 4,
            duration,
            flags: 0,
            capture_timestamp: 0,
        }
    }

    /// A byte frame for non-raw content, `byte_len` bytes of capacity.
    pub fn with_byte_capacity(byte_len: usize, duration: u32) -> Self {
        Self {
            data: vec![0.0; byte_len.div_ceil(4)],
            byte_len,
            duration,
            flags: frame_flags::NOT_RAW,
            capture_timestamp: 0,
        }
    }

    /// Length in samples per channel.
    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.duration = duration;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask == mask
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn is_raw(&self) -> bool {
        self.flags & frame_flags::NOT_RAW == 0
    }

    pub fn capture_timestamp(&self) -> i64 {
        self.capture_timestamp
    }

    pub fn set_capture_timestamp(&mut self, ns: i64) {
        self.capture_timestamp = ns;
    }

    /// Interleaved raw samples. Only meaningful while the frame is raw.
    pub fn samples(&self) -> &[f32] {
        debug_assert!(self.is_raw());
        &self.data
    }

    /// Mutable interleaved raw samples.
    pub fn samples_mut(&mut self) -> &mut [f32] {
        debug_assert!(self.is_raw());
        &mut self.data
    }

    /// Total sample count across channels.
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }

    /// Valid byte length.
    pub fn num_bytes(&self) -> usize {
        self.byte_len
    }

    /// Shrink or restore the valid byte length, up to the backing capacity.
    pub fn set_byte_len(&mut self, len: usize) {
        self.byte_len = len.min(self.data.len() * 4);
    }

    /// Byte view over the backing store.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr() as *const u8, self.byte_len) }
    }

    /// Mutable byte view over the backing store.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.data.as_mut_ptr() as *mut u8, self.byte_len)
        }
    }

    /// Clear flags and timestamps before a fresh read. Sample contents are
    /// left to the reader, which overwrites the full frame.
    pub fn reset(&mut self) {
        let not_raw = self.flags & frame_flags::NOT_RAW;
        self.flags = not_raw;
        self.capture_timestamp = 0;
    }
}
