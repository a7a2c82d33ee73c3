//! Startup gate that withholds packets until enough are buffered.
//!
//! A fresh session would otherwise feed the depacketizer one packet at a
//! time and stutter through its first jitter window. The delayed reader
//! accumulates upstream packets in a private sorted queue until their total
//! stream-timestamp span reaches the target, then switches to passthrough,
//! draining its queue before pulling upstream again.

use log::info;

use super::sorted_queue::SortedQueue;
use super::{stream_timestamp_diff, PacketPtr, PacketReader, PacketWriter, ReadMode};
use crate::status::Status;

pub struct DelayedReader<R: PacketReader> {
    reader: R,
    queue: SortedQueue,
    /// Remaining delay in stream timestamps; 0 once the gate has opened.
    delay: u32,
}

impl<R: PacketReader> DelayedReader<R> {
    /// `delay` is the target accumulation in samples per channel.
    pub fn new(reader: R, delay: u32) -> Self {
        Self {
            reader,
            queue: SortedQueue::new(0),
            delay,
        }
    }

    /// Span between the first and last buffered sample, clamped at zero.
    fn queue_span(&self) -> u32 {
        let (Some(head), Some(tail)) = (self.queue.head(), self.queue.tail()) else {
            return 0;
        };
        stream_timestamp_diff(tail.end(), head.begin()).max(0) as u32
    }
}

impl<R: PacketReader> PacketReader for DelayedReader<R> {
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status> {
        if self.delay != 0 {
            // Accumulation phase: soak up everything upstream has.
            loop {
                match self.reader.read(ReadMode::Fetch) {
                    Ok(pp) => self.queue.write(pp)?,
                    Err(Status::Drain) => break,
                    Err(e) => return Err(e),
                }
            }

            let span = self.queue_span();
            if span < self.delay {
                return Err(Status::Drain);
            }

            info!(
                "delayed reader: gate opened: delay={} samples={} packets={}",
                self.delay,
                span,
                self.queue.len()
            );
            self.delay = 0;
        }

        if !self.queue.is_empty() {
            self.queue.read(mode)
        } else {
            self.reader.read(mode)
        }
    }
}
