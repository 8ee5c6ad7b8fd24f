//! Per-worker buffer pool with reference-counted handles.
//!
//! Buffers are slots in an arena owned by a single worker loop. A [`Buffer`]
//! is a small copyable handle (slot index + generation); ownership is tracked
//! explicitly through [`BufferPool::retain`] and [`BufferPool::release`]
//! rather than by the handle's lifetime.
//!
//! ## Invariants
//!
//! - A freshly allocated buffer has a reference count of 1.
//! - The count reaches 0 exactly once; the slot then returns to the free list
//!   and its generation is bumped, so every outstanding handle goes stale.
//! - Touching a stale handle is a use-after-free. In strict mode (the default
//!   for debug builds) that panics; otherwise it is counted and reported as
//!   [`Error::UseAfterFree`].
//!
//! Slots keep their allocation across reuse, like the fixed buffers of a
//! classic pool, so steady-state reads do not hit the allocator. A slot's
//! storage is zeroed once when it is created and stays initialized; the
//! valid region is tracked separately, so reads never re-zero it.

use crate::error::{Error, Result};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Handle to a pooled buffer.
///
/// Copying the handle does not add a reference; call [`BufferPool::retain`]
/// for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer {
    index: usize,
    generation: u32,
}

impl Buffer {
    /// Slot index inside the owning pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Audit counters shared by every pool of a server.
#[derive(Debug, Default)]
pub struct BufferStats {
    allocated: AtomicU64,
    freed: AtomicU64,
    force_released: AtomicU64,
    use_after_free: AtomicU64,
}

/// Point-in-time copy of [`BufferStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatsSnapshot {
    pub allocated: u64,
    pub freed: u64,
    pub force_released: u64,
    pub use_after_free: u64,
}

impl BufferStatsSnapshot {
    /// Buffers allocated but not yet returned to a pool.
    pub fn outstanding(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

impl BufferStats {
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            allocated: self.allocated.load(Ordering::Acquire),
            freed: self.freed.load(Ordering::Acquire),
            force_released: self.force_released.load(Ordering::Acquire),
            use_after_free: self.use_after_free.load(Ordering::Acquire),
        }
    }
}

struct Slot {
    /// Initialized storage, at least `buffer_size` bytes once read into.
    data: BytesMut,
    /// Length of the valid region at the front of `data`.
    len: usize,
    refs: u32,
    generation: u32,
    /// Connection serial the buffer is charged to, if any.
    owner: Option<u64>,
}

/// Per-worker arena of reference-counted buffers.
///
/// Not thread-safe: each worker loop owns its own pool. Only the
/// [`BufferStats`] are shared.
pub struct BufferPool {
    slots: Vec<Slot>,
    /// Stack of free slot indices (LIFO for cache locality).
    free_list: Vec<usize>,
    max_buffers: usize,
    buffer_size: usize,
    strict: bool,
    stats: Arc<BufferStats>,
}

impl BufferPool {
    /// Create an empty pool.
    ///
    /// # Arguments
    /// * `max_buffers` - Upper bound on simultaneously live buffers
    /// * `buffer_size` - Bytes reserved per slot for socket reads
    pub fn new(max_buffers: usize, buffer_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            max_buffers,
            buffer_size,
            strict: cfg!(debug_assertions),
            stats: Arc::new(BufferStats::default()),
        }
    }

    /// Report into a shared set of counters.
    pub fn with_stats(mut self, stats: Arc<BufferStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Panic on refcount violations instead of returning an error.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn stats(&self) -> &Arc<BufferStats> {
        &self.stats
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.max_buffers
    }

    /// Number of buffers currently holding at least one reference.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Allocate an empty buffer with a reference count of 1.
    ///
    /// `owner` charges the buffer to a connection so it can be reclaimed by
    /// [`force_release_owned_by`](Self::force_release_owned_by).
    pub fn alloc(&mut self, owner: Option<u64>) -> Result<Buffer> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None if self.slots.len() < self.max_buffers => {
                let mut data = BytesMut::with_capacity(self.buffer_size);
                data.resize(self.buffer_size, 0);
                self.slots.push(Slot {
                    data,
                    len: 0,
                    refs: 0,
                    generation: 0,
                    owner: None,
                });
                self.slots.len() - 1
            }
            None => return Err(Error::PoolExhausted),
        };

        let slot = &mut self.slots[index];
        slot.len = 0;
        slot.refs = 1;
        slot.owner = owner;
        self.stats.allocated.fetch_add(1, Ordering::AcqRel);

        Ok(Buffer {
            index,
            generation: slot.generation,
        })
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn alloc_from(&mut self, owner: Option<u64>, bytes: &[u8]) -> Result<Buffer> {
        let buf = self.alloc(owner)?;
        let slot = &mut self.slots[buf.index];
        if slot.data.len() < bytes.len() {
            slot.data.resize(bytes.len(), 0);
        }
        slot.data[..bytes.len()].copy_from_slice(bytes);
        slot.len = bytes.len();
        Ok(buf)
    }

    /// Add a reference. Returns the same handle for convenience.
    pub fn retain(&mut self, buf: Buffer) -> Result<Buffer> {
        self.check(buf)?;
        self.slots[buf.index].refs += 1;
        Ok(buf)
    }

    /// Drop a reference. Returns `true` if this freed the buffer.
    pub fn release(&mut self, buf: Buffer) -> Result<bool> {
        self.check(buf)?;
        let slot = &mut self.slots[buf.index];
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(false);
        }
        self.free_slot(buf.index);
        Ok(true)
    }

    /// Current reference count, or `None` if the handle is stale.
    pub fn ref_count(&self, buf: Buffer) -> Option<u32> {
        self.slots
            .get(buf.index)
            .filter(|slot| slot.generation == buf.generation && slot.refs > 0)
            .map(|slot| slot.refs)
    }

    /// Read-only view of a buffer's bytes.
    pub fn get(&self, buf: Buffer) -> Result<&[u8]> {
        match self.slots.get(buf.index) {
            Some(slot) if slot.generation == buf.generation && slot.refs > 0 => {
                Ok(&slot.data[..slot.len])
            }
            _ => Err(self.violation(buf)),
        }
    }

    /// Mutable access to a buffer's bytes.
    pub fn get_mut(&mut self, buf: Buffer) -> Result<&mut [u8]> {
        self.check(buf)?;
        let slot = &mut self.slots[buf.index];
        Ok(&mut slot.data[..slot.len])
    }

    /// Slice of `buffer_size` bytes to read a socket into.
    ///
    /// The slice may still hold bytes from the slot's previous use. Follow
    /// with [`set_len`](Self::set_len) once the read size is known.
    pub(crate) fn read_target(&mut self, buf: Buffer) -> Result<&mut [u8]> {
        self.check(buf)?;
        let size = self.buffer_size;
        let slot = &mut self.slots[buf.index];
        if slot.data.len() < size {
            slot.data.resize(size, 0);
        }
        slot.len = 0;
        Ok(&mut slot.data[..size])
    }

    pub(crate) fn set_len(&mut self, buf: Buffer, len: usize) -> Result<()> {
        self.check(buf)?;
        let slot = &mut self.slots[buf.index];
        slot.len = len.min(slot.data.len());
        Ok(())
    }

    /// Free every buffer still charged to `owner`, whatever its count.
    ///
    /// Returns the number of buffers reclaimed this way.
    pub fn force_release_owned_by(&mut self, owner: u64) -> usize {
        let leaked: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.refs > 0 && slot.owner == Some(owner))
            .map(|(index, _)| index)
            .collect();

        for &index in &leaked {
            self.slots[index].refs = 0;
            self.free_slot(index);
        }
        self.stats
            .force_released
            .fetch_add(leaked.len() as u64, Ordering::AcqRel);
        leaked.len()
    }

    fn free_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.owner = None;
        slot.len = 0;
        self.free_list.push(index);
        self.stats.freed.fetch_add(1, Ordering::AcqRel);
    }

    fn check(&self, buf: Buffer) -> Result<()> {
        match self.slots.get(buf.index) {
            Some(slot) if slot.generation == buf.generation && slot.refs > 0 => Ok(()),
            _ => Err(self.violation(buf)),
        }
    }

    fn violation(&self, buf: Buffer) -> Error {
        self.stats.use_after_free.fetch_add(1, Ordering::AcqRel);
        if self.strict {
            panic!(
                "buffer {} (generation {}) used after its last release",
                buf.index, buf.generation
            );
        }
        warn!(
            index = buf.index,
            generation = buf.generation,
            "Buffer used after free"
        );
        Error::UseAfterFree {
            index: buf.index,
            generation: buf.generation,
        }
    }
}
