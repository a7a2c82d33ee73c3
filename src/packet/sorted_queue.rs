//! Insertion-sorted packet queue with modular compare.
//!
//! Packets come in arrival order and go out in sequence order. Duplicates
//! are dropped. The queue remembers the newest packet it has ever seen (by
//! modular compare) even after that packet is read out; the latency
//! monitor uses it to measure the pipeline tail.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::{PacketPtr, PacketReader, PacketWriter, ReadMode};
use crate::status::Status;

/// Size-bounded modular-sorted queue. Not thread-safe; see `SharedQueue`.
#[derive(Debug)]
pub struct SortedQueue {
    list: VecDeque<PacketPtr>,
    /// Maximum number of queued packets, 0 = unlimited.
    max_size: usize,
    /// Newest packet ever enqueued, by modular compare.
    latest: Option<PacketPtr>,
}

impl SortedQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            list: VecDeque::new(),
            max_size,
            latest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Oldest queued packet.
    pub fn head(&self) -> Option<PacketPtr> {
        self.list.front().cloned()
    }

    /// Newest queued packet.
    pub fn tail(&self) -> Option<PacketPtr> {
        self.list.back().cloned()
    }

    /// Newest packet ever enqueued, kept even after it was read.
    pub fn latest(&self) -> Option<PacketPtr> {
        self.latest.clone()
    }

    /// Position where `packet` keeps the list sorted, scanning from the
    /// back since packets usually arrive nearly in order. `None` marks a
    /// duplicate.
    fn insert_position(&self, packet: &PacketPtr) -> Option<usize> {
        let mut pos = self.list.len();
        while pos > 0 {
            match packet.compare(&self.list[pos - 1]) {
                std::cmp::Ordering::Less => pos -= 1,
                std::cmp::Ordering::Equal => return None,
                std::cmp::Ordering::Greater => break,
            }
        }
        Some(pos)
    }
}

impl PacketWriter for SortedQueue {
    fn write(&mut self, packet: PacketPtr) -> Result<(), Status> {
        if self.max_size > 0 && self.list.len() == self.max_size {
            debug!(
                "sorted queue: queue is full, dropping packet: max_size={}",
                self.max_size
            );
            return Ok(());
        }

        match &self.latest {
            Some(latest) if latest.compare(&packet) == std::cmp::Ordering::Greater => {}
            _ => self.latest = Some(Arc::clone(&packet)),
        }

        match self.insert_position(&packet) {
            Some(pos) => self.list.insert(pos, packet),
            None => debug!("sorted queue: dropping duplicate packet"),
        }
        Ok(())
    }
}

impl PacketReader for SortedQueue {
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status> {
        match mode {
            ReadMode::Peek => self.head().ok_or(Status::Drain),
            ReadMode::Fetch => self.list.pop_front().ok_or(Status::Drain),
        }
    }
}

/// A sorted queue behind the per-session lock, so the network thread can
/// enqueue while the device thread dequeues. The lock is held only for the
/// duration of a single operation, never across upstream pulls.
#[derive(Clone, Debug)]
pub struct SharedQueue {
    inner: Arc<Mutex<SortedQueue>>,
}

impl SharedQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SortedQueue::new(max_size))),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn latest(&self) -> Option<PacketPtr> {
        self.inner.lock().latest()
    }
}

impl PacketWriter for SharedQueue {
    fn write(&mut self, packet: PacketPtr) -> Result<(), Status> {
        self.inner.lock().write(packet)
    }
}

impl PacketReader for SharedQueue {
    fn read(&mut self, mode: ReadMode) -> Result<PacketPtr, Status> {
        self.inner.lock().read(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{flags, Packet, PacketFactory, RtpFields};

    fn make_packet(factory: &PacketFactory, sn: u16) -> PacketPtr {
        Packet::new(
            factory.buffer_from(&[0u8; 4]).unwrap(),
            flags::RTP | flags::AUDIO,
            Some(RtpFields {
                source_id: 1,
                seqnum: sn,
                stream_timestamp: sn as u32 * 4,
                marker: false,
                payload_type: 96,
                duration: 4,
                payload: 0..4,
            }),
            None,
            0,
        )
    }

    fn fetch_all(q: &mut SortedQueue) -> Vec<u16> {
        let mut out = Vec::new();
        while let Ok(pp) = q.read(ReadMode::Fetch) {
            out.push(pp.rtp().unwrap().seqnum);
        }
        out
    }

    #[test]
    fn test_empty() {
        let mut q = SortedQueue::new(0);
        assert_eq!(q.read(ReadMode::Fetch).unwrap_err(), Status::Drain);
        assert_eq!(q.read(ReadMode::Peek).unwrap_err(), Status::Drain);
        assert!(q.latest().is_none());
    }

    #[test]
    fn test_duplicates_and_order() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        for sn in [3u16, 1, 4, 1, 5, 9, 2, 6, 5, 3] {
            q.write(make_packet(&factory, sn)).unwrap();
        }
        assert_eq!(fetch_all(&mut q), vec![1, 2, 3, 4, 5, 6, 9]);
    }

    #[test]
    fn test_wraparound_order() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        for sn in [1u16, 65534, 2, 0, 65535] {
            q.write(make_packet(&factory, sn)).unwrap();
        }
        assert_eq!(fetch_all(&mut q), vec![65534, 65535, 0, 1, 2]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        q.write(make_packet(&factory, 10)).unwrap();
        assert_eq!(q.read(ReadMode::Peek).unwrap().rtp().unwrap().seqnum, 10);
        assert_eq!(q.len(), 1);
        assert_eq!(q.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 10);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_max_size() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(2);
        q.write(make_packet(&factory, 1)).unwrap();
        q.write(make_packet(&factory, 2)).unwrap();
        q.write(make_packet(&factory, 3)).unwrap(); // dropped
        assert_eq!(fetch_all(&mut q), vec![1, 2]);
    }

    #[test]
    fn test_latest_survives_fetch() {
        let factory = PacketFactory::new(16);
        let mut q = SortedQueue::new(0);
        q.write(make_packet(&factory, 5)).unwrap();
        q.write(make_packet(&factory, 3)).unwrap();
        assert_eq!(q.latest().unwrap().rtp().unwrap().seqnum, 5);

        fetch_all(&mut q);
        assert_eq!(q.latest().unwrap().rtp().unwrap().seqnum, 5);

        // An older packet does not replace latest.
        q.write(make_packet(&factory, 4)).unwrap();
        assert_eq!(q.latest().unwrap().rtp().unwrap().seqnum, 5);

        // A newer one does, including across the wrap point.
        q.write(make_packet(&factory, 6)).unwrap();
        assert_eq!(q.latest().unwrap().rtp().unwrap().seqnum, 6);
    }

    #[test]
    fn test_shared_queue_locks_per_op() {
        let factory = PacketFactory::new(16);
        let mut q = SharedQueue::new(0);
        let mut q2 = q.clone();
        q.write(make_packet(&factory, 1)).unwrap();
        assert_eq!(q2.read(ReadMode::Fetch).unwrap().rtp().unwrap().seqnum, 1);
        assert!(q.is_empty());
        assert!(q.latest().is_some());
    }
}
