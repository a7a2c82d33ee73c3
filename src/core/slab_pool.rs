//! Slab-pool allocator with canary-guarded slots.
//!
//! A pool serves one fixed object size. Memory is acquired from the system
//! allocator in slabs; each slab is cut into slots. Slot layout:
//!
//! ```text
//! [ header (owner pool) | canary | payload (max-aligned) | canary + padding ]
//! ```
//!
//! Every `deallocate` verifies both canaries and the owner field, so
//! overruns and foreign frees are caught at the moment of return. Payloads
//! are filled with a poison pattern on allocation and again on free.
//!
//! The pool is internally mutex-protected; `allocate`/`deallocate` are safe
//! from any thread. Guard violations increment a counter and, if the pool is
//! configured to, panic.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use super::memory;

/// Alignment every payload is guaranteed to have.
const MAX_ALIGN: usize = 16;

/// Size of the owner header preceding the leading canary.
/// Kept at `MAX_ALIGN` so the payload offset stays max-aligned.
const HEADER_SIZE: usize = MAX_ALIGN;

/// Size of the leading canary region. The trailing canary is at least this
/// big and additionally absorbs the alignment padding.
const CANARY_SIZE: usize = MAX_ALIGN;

/// Offset from slot base to payload.
const PAYLOAD_OFFSET: usize = HEADER_SIZE + CANARY_SIZE;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SlabPoolConfig {
    /// Payload size served by this pool.
    pub object_size: usize,
    /// Minimum slab size in bytes (0 = one slot per slab initially).
    pub min_slab_bytes: usize,
    /// Maximum slab size in bytes (0 = unlimited growth).
    pub max_slab_bytes: usize,
    /// Panic on canary/ownership/leak violations instead of only counting.
    pub panic_on_violation: bool,
}

impl Default for SlabPoolConfig {
    fn default() -> Self {
        Self {
            object_size: 0,
            min_slab_bytes: 4096,
            max_slab_bytes: 256 * 1024,
            panic_on_violation: true,
        }
    }
}

struct Inner {
    /// Free slot base pointers.
    free_slots: Vec<NonNull<u8>>,
    /// Owned slabs, freed on drop.
    slabs: Vec<(NonNull<u8>, Layout)>,
    /// Slots in the next slab to allocate; doubles each growth.
    slab_cur_slots: usize,
    /// Cap on slots per slab (0 = uncapped).
    slab_max_slots: usize,
    /// Currently handed-out slots.
    n_used_slots: usize,
}

/// Typed-by-size allocator with guarded slots.
pub struct SlabPool {
    name: &'static str,
    object_size: usize,
    slot_size: usize,
    panic_on_violation: bool,
    guard_failures: AtomicUsize,
    inner: Mutex<Inner>,
}

// Raw pointers inside are only touched under the mutex or by the exclusive
// owner of an allocation.
unsafe impl Send for SlabPool {}
unsafe impl Sync for SlabPool {}

impl SlabPool {
    /// Create a pool serving `config.object_size`-byte payloads.
    pub fn new(name: &'static str, config: SlabPoolConfig) -> Self {
        let unaligned = PAYLOAD_OFFSET + config.object_size + CANARY_SIZE;
        let slot_size = unaligned.div_ceil(MAX_ALIGN) * MAX_ALIGN;

        let slab_cur_slots = if config.min_slab_bytes == 0 {
            1
        } else {
            (config.min_slab_bytes / slot_size).max(1)
        };
        let slab_max_slots = if config.max_slab_bytes == 0 {
            0
        } else {
            (config.max_slab_bytes / slot_size).max(1)
        };

        debug!(
            "slab pool ({}): initializing: object_size={} slot_size={} \
             min_slab={} slots max_slab={} slots",
            name, config.object_size, slot_size, slab_cur_slots, slab_max_slots
        );

        Self {
            name,
            object_size: config.object_size,
            slot_size,
            panic_on_violation: config.panic_on_violation,
            guard_failures: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                free_slots: Vec::new(),
                slabs: Vec::new(),
                slab_cur_slots,
                slab_max_slots,
                n_used_slots: 0,
            }),
        }
    }

    /// Payload size served by this pool.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Full slot size including header, canaries and padding.
    pub fn allocation_size(&self) -> usize {
        self.slot_size
    }

    /// Number of guard violations observed so far.
    pub fn num_guard_failures(&self) -> usize {
        self.guard_failures.load(Ordering::Relaxed)
    }

    /// Grow the free list to at least `n` slots.
    /// Returns false if the system allocator refused.
    pub fn reserve(&self, n: usize) -> bool {
        let mut inner = self.inner.lock();
        while inner.free_slots.len() < n {
            if !self.allocate_new_slab(&mut inner) {
                return false;
            }
        }
        true
    }

    /// Pop a slot, growing the pool by one slab if empty.
    ///
    /// The returned pointer addresses `object_size` poisoned bytes framed by
    /// freshly stamped canaries. Returns `None` if the system allocator
    /// refused.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let slot = {
            let mut inner = self.inner.lock();
            if inner.free_slots.is_empty() && !self.allocate_new_slab(&mut inner) {
                return None;
            }
            let slot = inner.free_slots.pop()?;
            inner.n_used_slots += 1;
            slot
        };

        unsafe {
            let base = slot.as_ptr();
            // Stamp the owner so foreign frees are detectable.
            (base as *mut *const SlabPool).write(self as *const SlabPool);

            let canary_before = std::slice::from_raw_parts_mut(base.add(HEADER_SIZE), CANARY_SIZE);
            memory::prepare_canary(canary_before);

            let payload =
                std::slice::from_raw_parts_mut(base.add(PAYLOAD_OFFSET), self.object_size);
            memory::poison_before_use(payload);

            let tail_len = self.slot_size - PAYLOAD_OFFSET - self.object_size;
            let canary_after = std::slice::from_raw_parts_mut(
                base.add(PAYLOAD_OFFSET + self.object_size),
                tail_len,
            );
            memory::prepare_canary(canary_after);

            Some(NonNull::new_unchecked(base.add(PAYLOAD_OFFSET)))
        }
    }

    /// Return a payload pointer previously obtained from `allocate`.
    ///
    /// Verifies the owner header and both canaries. On an ownership failure
    /// the slot is not touched (it belongs to another pool, or to nobody);
    /// on a canary failure it is still returned to the free list after
    /// reporting.
    ///
    /// # Safety
    ///
    /// `payload` must have come from `allocate` on some `SlabPool` and must
    /// not be used after this call.
    pub unsafe fn deallocate(&self, payload: NonNull<u8>) {
        let base = payload.as_ptr().sub(PAYLOAD_OFFSET);

        let owner = (base as *const *const SlabPool).read();
        if !std::ptr::eq(owner, self as *const SlabPool) {
            self.report_guard("slot does not belong to this pool");
            return;
        }

        let canary_before = std::slice::from_raw_parts(base.add(HEADER_SIZE), CANARY_SIZE);
        let tail_len = self.slot_size - PAYLOAD_OFFSET - self.object_size;
        let canary_after =
            std::slice::from_raw_parts(base.add(PAYLOAD_OFFSET + self.object_size), tail_len);

        let before_ok = memory::check_canary(canary_before);
        let after_ok = memory::check_canary(canary_after);
        if !before_ok || !after_ok {
            self.report_guard(if !before_ok {
                "header canary corrupted"
            } else {
                "footer canary corrupted"
            });
        }

        let payload_region = std::slice::from_raw_parts_mut(payload.as_ptr(), self.object_size);
        memory::poison_after_use(payload_region);

        let mut inner = self.inner.lock();
        if inner.n_used_slots == 0 {
            drop(inner);
            self.report_guard("unpaired deallocation");
            return;
        }
        inner.n_used_slots -= 1;
        inner.free_slots.push(NonNull::new_unchecked(base));
    }

    fn allocate_new_slab(&self, inner: &mut Inner) -> bool {
        let n_slots = inner.slab_cur_slots;
        let layout = match Layout::from_size_align(n_slots * self.slot_size, MAX_ALIGN) {
            Ok(l) => l,
            Err(_) => return false,
        };

        let memory = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(memory) else {
            error!("slab pool ({}): slab allocation failed", self.name);
            return false;
        };

        inner.slabs.push((base, layout));
        for n in 0..n_slots {
            let slot = unsafe { NonNull::new_unchecked(base.as_ptr().add(n * self.slot_size)) };
            inner.free_slots.push(slot);
        }

        // Next slab is twice as big, up to the cap.
        inner.slab_cur_slots = if inner.slab_max_slots != 0 {
            (n_slots * 2).min(inner.slab_max_slots)
        } else {
            n_slots * 2
        };

        true
    }

    fn report_guard(&self, what: &str) {
        self.guard_failures.fetch_add(1, Ordering::Relaxed);
        error!("slab pool ({}): {}", self.name, what);
        if self.panic_on_violation {
            panic!("slab pool ({}): {}", self.name, what);
        }
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.n_used_slots != 0 {
            self.guard_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                "slab pool ({}): leak detected: n_used={}",
                self.name, inner.n_used_slots
            );
            if self.panic_on_violation && !std::thread::panicking() {
                panic!(
                    "slab pool ({}): leak detected: n_used={}",
                    self.name, inner.n_used_slots
                );
            }
        }
        for (base, layout) in inner.slabs.drain(..) {
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}

/// Pool of fixed-capacity byte buffers, the safe face of `SlabPool`.
pub struct BufferPool {
    pool: Arc<SlabPool>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte buffers.
    pub fn new(name: &'static str, buffer_size: usize) -> Self {
        let config = SlabPoolConfig {
            object_size: buffer_size,
            ..SlabPoolConfig::default()
        };
        Self {
            pool: Arc::new(SlabPool::new(name, config)),
            buffer_size,
        }
    }

    /// Buffer capacity served by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Pre-grow the underlying pool.
    pub fn reserve(&self, n: usize) -> bool {
        self.pool.reserve(n)
    }

    /// Guard violations observed by the underlying pool.
    pub fn num_guard_failures(&self) -> usize {
        self.pool.num_guard_failures()
    }

    /// Acquire a buffer. Contents are the allocation poison pattern; the
    /// logical length starts at full capacity and can be shrunk.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let ptr = self.pool.allocate()?;
        Some(PooledBuffer {
            pool: Arc::clone(&self.pool),
            ptr,
            cap: self.buffer_size,
            len: self.buffer_size,
        })
    }
}

/// Byte buffer backed by a slab-pool slot. Returns the slot on drop.
pub struct PooledBuffer {
    pool: Arc<SlabPool>,
    ptr: NonNull<u8>,
    cap: usize,
    len: usize,
}

// The buffer owns its slot exclusively; shared references only expose &[u8].
unsafe impl Send for PooledBuffer {}
unsafe impl Sync for PooledBuffer {}

impl PooledBuffer {
    /// Current logical length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot capacity.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Shrink the logical length. No-op if `len` exceeds it.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Reset the logical length up to capacity.
    pub fn resize_to(&mut self, len: usize) -> bool {
        if len > self.cap {
            return false;
        }
        self.len = len;
        true
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        unsafe { self.pool.deallocate(self.ptr) };
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}
