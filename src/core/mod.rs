//! Low-level building blocks shared by the whole pipeline:
//! memory poisoning, the slab-pool allocator, the lock-free SPSC
//! buffers, and endian helpers.

pub mod endian;
pub mod memory;
pub mod slab_pool;
pub mod spsc;
