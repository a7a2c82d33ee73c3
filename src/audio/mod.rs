//! Audio half of the pipeline: sample formats, frames, and the frame
//! reader chain from depacketizer up to the latency monitor.

pub mod channels;
pub mod depacketizer;
pub mod frame;
pub mod freq_estimator;
pub mod latency_monitor;
pub mod pcm;
pub mod pcm_mapper;
pub mod resampler;
pub mod sample_spec;
pub mod watchdog;

use crate::status::Status;
use frame::Frame;

/// Pull seam between frame pipeline stages.
///
/// A reader fills the frame to its full requested duration. Samples it could
/// not source are explicit zeros and the frame carries `INCOMPLETE`; the
/// `Err` side is reserved for conditions that end or break the session.
pub trait FrameReader {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status>;
}

impl FrameReader for Box<dyn FrameReader + Send> {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        (**self).read(frame)
    }
}

/// Push seam for frame consumers (sinks, push-side converters).
pub trait FrameWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), Status>;
}

impl FrameWriter for Box<dyn FrameWriter + Send> {
    fn write(&mut self, frame: &Frame) -> Result<(), Status> {
        (**self).write(frame)
    }
}
