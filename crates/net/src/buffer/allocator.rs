use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::buffer::PoolBuf;
use crate::protocol::AllocError;

/// Number of buffers a size class grows by when its free list runs dry.
pub const DEFAULT_EXPAND_BATCH: usize = 64;

/// Free list of one size class together with its bookkeeping.
#[derive(Debug, Default)]
pub struct FreeList {
    buffers: Vec<Box<[u8]>>,
    created: usize,
}

/// Guards the free list of a size class.
///
/// [`LocalLock`] is the single-threaded fast path, [`SharedLock`] is the
/// mutex-guarded mode for allocators shared between I/O tasks.
pub trait FreeListLock: Default {
    fn with<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R;
}

/// Unguarded free list. Allocators using it are neither `Send` nor `Sync`.
#[derive(Debug, Default)]
pub struct LocalLock(RefCell<FreeList>);

impl FreeListLock for LocalLock {
    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

/// Mutex-guarded free list.
#[derive(Debug, Default)]
pub struct SharedLock(Mutex<FreeList>);

impl FreeListLock for SharedLock {
    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        // a panic while holding the lock can only interrupt a push or a pop
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[derive(Debug)]
struct SizeClass<L> {
    capacity: usize,
    free: L,
}

#[derive(Debug)]
pub(crate) struct Pools<L> {
    classes: Vec<SizeClass<L>>,
    batch: usize,
}

impl<L: FreeListLock> Pools<L> {
    fn class_index(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|class| class.capacity >= size)
    }

    pub(crate) fn give_back(&self, class: usize, data: Box<[u8]>) {
        debug_assert_eq!(self.classes[class].capacity, data.len());
        self.classes[class].free.with(|list| list.buffers.push(data));
    }

    fn expand(list: &mut FreeList, capacity: usize, batch: usize) -> Result<(), AllocError> {
        let oom = AllocError::OutOfMemory { capacity, batch };
        if list.buffers.try_reserve(batch).is_err() {
            return Err(oom);
        }
        for _ in 0..batch {
            let mut data = Vec::new();
            if data.try_reserve_exact(capacity).is_err() {
                return Err(oom);
            }
            data.resize(capacity, 0);
            list.buffers.push(data.into_boxed_slice());
        }
        list.created += batch;
        trace!(capacity, batch, created = list.created, "expanded size class");
        Ok(())
    }
}

/// A fixed size-class buffer allocator.
///
/// Pools are declared up front, one per distinct size the caller needs. A
/// request is served from the smallest class whose capacity fits it; an empty
/// class first grows by a whole batch. Buffers come back as move-only
/// [`PoolBuf`] handles that return to their own class when dropped, so a
/// buffer can neither be freed twice nor touched after it went back.
///
/// The lock mode is part of the type: see [`LocalAllocator`] and
/// [`SharedAllocator`].
pub struct BufferAllocator<L: FreeListLock = SharedLock> {
    pools: Arc<Pools<L>>,
}

/// Single-threaded allocator, cannot leave the thread that created it.
pub type LocalAllocator = BufferAllocator<LocalLock>;

/// Allocator that may be shared by sessions running on different worker threads.
pub type SharedAllocator = BufferAllocator<SharedLock>;

impl<L: FreeListLock> BufferAllocator<L> {
    /// Declares one pool per distinct, non-zero size in `classes`.
    pub fn new(classes: &[usize]) -> Self {
        Self::with_batch(classes, DEFAULT_EXPAND_BATCH)
    }

    pub fn with_batch(classes: &[usize], batch: usize) -> Self {
        let mut sizes = classes.iter().copied().filter(|size| *size > 0).collect::<Vec<_>>();
        sizes.sort_unstable();
        sizes.dedup();

        let classes = sizes.into_iter().map(|capacity| SizeClass { capacity, free: L::default() }).collect();
        Self { pools: Arc::new(Pools { classes, batch: batch.max(1) }) }
    }

    /// Returns a zero-filled buffer holding at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<PoolBuf<L>, AllocError> {
        let index = self.pools.class_index(size).ok_or_else(|| AllocError::NoSizeClass {
            requested: size,
            largest: self.largest_class(),
        })?;

        let class = &self.pools.classes[index];
        let batch = self.pools.batch;
        let mut data = class.free.with(|list| {
            if list.buffers.is_empty() {
                Pools::<L>::expand(list, class.capacity, batch)?;
            }
            list.buffers.pop().ok_or(AllocError::OutOfMemory { capacity: class.capacity, batch })
        })?;

        data.fill(0);
        Ok(PoolBuf::new(data, size, index, Arc::clone(&self.pools)))
    }

    /// Capacities of the declared classes, ascending.
    pub fn classes(&self) -> Vec<usize> {
        self.pools.classes.iter().map(|class| class.capacity).collect()
    }

    pub fn largest_class(&self) -> usize {
        self.pools.classes.last().map_or(0, |class| class.capacity)
    }

    /// Buffers currently sitting on the free list of the class with `capacity`.
    pub fn available(&self, capacity: usize) -> usize {
        self.find_class(capacity).map_or(0, |class| class.free.with(|list| list.buffers.len()))
    }

    /// Buffers ever created for the class with `capacity`.
    pub fn created(&self, capacity: usize) -> usize {
        self.find_class(capacity).map_or(0, |class| class.free.with(|list| list.created))
    }

    fn find_class(&self, capacity: usize) -> Option<&SizeClass<L>> {
        self.pools.classes.iter().find(|class| class.capacity == capacity)
    }
}

impl<L: FreeListLock> Clone for BufferAllocator<L> {
    fn clone(&self) -> Self {
        Self { pools: Arc::clone(&self.pools) }
    }
}

impl<L: FreeListLock> fmt::Debug for BufferAllocator<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator").field("classes", &self.classes()).field("batch", &self.pools.batch).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_alloc_picks_smallest_fitting_class() {
        let allocator = LocalAllocator::new(&[32, 64, 256]);

        let buf = allocator.alloc(10).unwrap();
        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.len(), 10);

        let buf = allocator.alloc(33).unwrap();
        assert_eq!(buf.capacity(), 64);

        let buf = allocator.alloc(256).unwrap();
        assert_eq!(buf.capacity(), 256);
    }

    #[test]
    fn test_expand_by_batch() {
        let allocator = LocalAllocator::new(&[32]);
        assert_eq!(allocator.created(32), 0);

        let first = allocator.alloc(8).unwrap();
        assert_eq!(allocator.created(32), DEFAULT_EXPAND_BATCH);
        assert_eq!(allocator.available(32), DEFAULT_EXPAND_BATCH - 1);

        let rest = (1..DEFAULT_EXPAND_BATCH).map(|_| allocator.alloc(8).unwrap()).collect::<Vec<_>>();
        assert_eq!(allocator.available(32), 0);

        let _one_more = allocator.alloc(8).unwrap();
        assert_eq!(allocator.created(32), DEFAULT_EXPAND_BATCH * 2);

        drop(first);
        drop(rest);
        assert_eq!(allocator.available(32), DEFAULT_EXPAND_BATCH * 2 - 1);
    }

    #[test]
    fn test_buffers_are_zero_filled_after_reuse() {
        let allocator = LocalAllocator::with_batch(&[16], 1);

        let mut buf = allocator.alloc(16).unwrap();
        buf.fill(0xAB);
        drop(buf);

        let buf = allocator.alloc(16).unwrap();
        assert_eq!(allocator.created(16), 1);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_live_buffers_never_alias() {
        let allocator = LocalAllocator::with_batch(&[32, 64], 4);
        let mut live = Vec::new();
        let mut seen = HashSet::new();

        for round in 0..50 {
            let size = if round % 3 == 0 { 40 } else { 20 };
            let buf = allocator.alloc(size).unwrap();
            assert!(buf.capacity() >= size);
            assert!(seen.insert(buf.as_ptr() as usize));
            live.push(buf);

            if round % 4 == 3 {
                let released = live.remove(0);
                seen.remove(&(released.as_ptr() as usize));
            }
        }
    }

    #[test]
    fn test_buffer_returns_to_its_own_class() {
        let allocator = LocalAllocator::with_batch(&[32, 64], 2);
        let small = allocator.alloc(1).unwrap();
        let large = allocator.alloc(40).unwrap();
        assert_eq!(allocator.available(32), 1);
        assert_eq!(allocator.available(64), 1);

        large.release();
        assert_eq!(allocator.available(32), 1);
        assert_eq!(allocator.available(64), 2);

        drop(small);
        assert_eq!(allocator.available(32), 2);
    }

    #[test]
    fn test_no_size_class() {
        let allocator = LocalAllocator::new(&[32, 64]);
        let error = allocator.alloc(65).unwrap_err();
        assert!(matches!(error, AllocError::NoSizeClass { requested: 65, largest: 64 }));
    }

    #[test]
    fn test_classes_are_sorted_and_deduplicated() {
        let allocator = SharedAllocator::new(&[256, 0, 32, 256, 64]);
        assert_eq!(allocator.classes(), vec![32, 64, 256]);
        assert_eq!(allocator.largest_class(), 256);
    }

    #[test]
    fn test_shared_allocator_across_threads() {
        let allocator = SharedAllocator::with_batch(&[64], 8);

        let handles = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = allocator.alloc(64).unwrap();
                        assert!(buf.iter().all(|b| *b == 0));
                        buf.fill(1);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allocator.available(64), allocator.created(64));
    }
}
