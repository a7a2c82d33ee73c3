//! Lock-free single-producer single-consumer buffers.
//!
//! `byte_buffer` gives a chunked byte queue with two-phase access: the
//! producer calls `begin_write` to get the next chunk, fills it, then
//! `end_write` publishes it; the consumer mirrors with `begin_read` /
//! `end_read`. `ring` layers a typed element queue on top.
//!
//! Cursor protocol: `read_pos` starts at 0, `write_pos` at 1, both advance
//! monotonically; the storage has one guard chunk, so empty is
//! `read_pos + 1 == write_pos` and full is `write_pos - read_pos >= N + 1`.
//! Cross-thread loads and the publishing increments are sequentially
//! consistent, so data written into a chunk before `end_write` is visible
//! after the matching successful `begin_read`.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Shared {
    chunk_size: usize,
    /// N + 1: requested capacity plus the guard chunk.
    chunk_count: usize,
    data: Box<[UnsafeCell<u8>]>,
    read_pos: AtomicU32,
    write_pos: AtomicU32,
}

// Access to `data` is partitioned by the cursor protocol: the producer only
// touches the chunk at write_pos, the consumer the one at read_pos + 1, and
// the guard chunk keeps them disjoint.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn is_empty(&self) -> bool {
        let wr = self.write_pos.load(Ordering::SeqCst);
        let rd = self.read_pos.load(Ordering::SeqCst);
        rd.wrapping_add(1) == wr
    }

    fn chunk_ptr(&self, pos: u32) -> *mut u8 {
        let index = (pos as usize % self.chunk_count) * self.chunk_size;
        self.data[index].get()
    }
}

/// Writer half of a chunked SPSC byte buffer.
#[derive(Debug)]
pub struct ByteProducer {
    shared: Arc<Shared>,
}

/// Reader half of a chunked SPSC byte buffer.
#[derive(Debug)]
pub struct ByteConsumer {
    shared: Arc<Shared>,
}

/// Create a byte buffer of `n_chunks` chunks of `chunk_size` bytes each.
pub fn byte_buffer(chunk_size: usize, n_chunks: usize) -> (ByteProducer, ByteConsumer) {
    assert!(chunk_size > 0 && n_chunks > 0);

    let chunk_count = n_chunks + 1;
    let mut data = Vec::with_capacity(chunk_count * chunk_size);
    data.resize_with(chunk_count * chunk_size, || UnsafeCell::new(0));

    let shared = Arc::new(Shared {
        chunk_size,
        chunk_count,
        data: data.into_boxed_slice(),
        read_pos: AtomicU32::new(0),
        write_pos: AtomicU32::new(1),
    });

    (
        ByteProducer {
            shared: Arc::clone(&shared),
        },
        ByteConsumer { shared },
    )
}

impl ByteProducer {
    /// Next writable chunk, or `None` if the buffer is full.
    /// The write is not visible to the consumer until `end_write`.
    pub fn begin_write(&mut self) -> Option<&mut [u8]> {
        let wr = self.shared.write_pos.load(Ordering::Relaxed);
        let rd = self.shared.read_pos.load(Ordering::SeqCst);

        if wr.wrapping_sub(rd) as usize >= self.shared.chunk_count {
            return None;
        }

        let ptr = self.shared.chunk_ptr(wr);
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.shared.chunk_size) })
    }

    /// Publish the chunk handed out by the last `begin_write`.
    pub fn end_write(&mut self) {
        self.shared.write_pos.fetch_add(1, Ordering::SeqCst);
    }

    /// May be called concurrently with the consumer.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }
}

impl ByteConsumer {
    /// Next readable chunk, or `None` if the buffer is empty.
    pub fn begin_read(&mut self) -> Option<&[u8]> {
        let rd = self.shared.read_pos.load(Ordering::Relaxed);
        let wr = self.shared.write_pos.load(Ordering::SeqCst);

        if rd.wrapping_add(1) == wr {
            return None;
        }

        let ptr = self.shared.chunk_ptr(rd.wrapping_add(1));
        Some(unsafe { std::slice::from_raw_parts(ptr, self.shared.chunk_size) })
    }

    /// Release the chunk handed out by the last `begin_read`.
    pub fn end_read(&mut self) {
        self.shared.read_pos.fetch_add(1, Ordering::SeqCst);
    }

    /// May be called concurrently with the producer.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }
}

/// Writer half of a typed SPSC ring.
#[derive(Debug)]
pub struct RingProducer<T: Send> {
    inner: ByteProducer,
    _marker: PhantomData<T>,
}

/// Reader half of a typed SPSC ring.
#[derive(Debug)]
pub struct RingConsumer<T: Send> {
    inner: ByteConsumer,
    _marker: PhantomData<T>,
}

/// Create a typed ring holding up to `n_elements` values of `T`.
pub fn ring<T: Send>(n_elements: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let chunk_size = std::mem::size_of::<T>().max(1);
    let (p, c) = byte_buffer(chunk_size, n_elements);
    (
        RingProducer {
            inner: p,
            _marker: PhantomData,
        },
        RingConsumer {
            inner: c,
            _marker: PhantomData,
        },
    )
}

impl<T: Send> RingProducer<T> {
    /// Append an element. If the ring is full the element is dropped and
    /// `false` is returned; the producer never blocks.
    pub fn push_back(&mut self, value: T) -> bool {
        match self.inner.begin_write() {
            Some(chunk) => {
                unsafe { (chunk.as_mut_ptr() as *mut T).write_unaligned(value) };
                self.inner.end_write();
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T: Send> RingConsumer<T> {
    /// Fetch the oldest element, or `None` if the ring is empty.
    pub fn pop_front(&mut self) -> Option<T> {
        let chunk = self.inner.begin_read()?;
        let value = unsafe { (chunk.as_ptr() as *const T).read_unaligned() };
        self.inner.end_read();
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T: Send> Drop for RingConsumer<T> {
    fn drop(&mut self) {
        // Elements still queued own resources; drain and drop them.
        while self.pop_front().is_some() {}
    }
}
