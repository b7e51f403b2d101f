use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::buffer::allocator::{FreeListLock, Pools, SharedLock};
use crate::ensure;
use crate::protocol::AllocError;

/// An owned buffer handed out by a [`BufferAllocator`](crate::buffer::BufferAllocator).
///
/// The buffer has a fixed capacity (the capacity of its size class) and a
/// logical length that never exceeds it. Dereferencing yields the logical
/// part only; [`PoolBuf::as_full_mut`] exposes the whole capacity for writers
/// that fill the buffer before fixing its length.
///
/// Dropping the handle returns the memory to the free list it came from.
pub struct PoolBuf<L: FreeListLock = SharedLock> {
    data: Box<[u8]>,
    len: usize,
    class: usize,
    pools: Arc<Pools<L>>,
}

impl<L: FreeListLock> PoolBuf<L> {
    pub(crate) fn new(data: Box<[u8]>, len: usize, class: usize, pools: Arc<Pools<L>>) -> Self {
        debug_assert!(len <= data.len());
        Self { data, len, class, pools }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the size class this buffer belongs to.
    #[inline]
    pub fn size_class(&self) -> usize {
        self.class
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), AllocError> {
        ensure!(len <= self.capacity(), AllocError::LengthOverflow { len, capacity: self.capacity() });
        self.len = len;
        Ok(())
    }

    /// The whole capacity, regardless of the logical length.
    #[inline]
    pub fn as_full_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zeroes the buffer and resets its length.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    /// Hands the buffer back to its pool right away.
    pub fn release(self) {
        drop(self);
    }
}

impl<L: FreeListLock> Deref for PoolBuf<L> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..self.len]
    }
}

impl<L: FreeListLock> DerefMut for PoolBuf<L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..self.len]
    }
}

impl<L: FreeListLock> AsRef<[u8]> for PoolBuf<L> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl<L: FreeListLock> Drop for PoolBuf<L> {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        if !data.is_empty() {
            self.pools.give_back(self.class, data);
        }
    }
}

impl<L: FreeListLock> fmt::Debug for PoolBuf<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf").field("len", &self.len).field("capacity", &self.capacity()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::LocalAllocator;
    use crate::protocol::AllocError;

    #[test]
    fn test_set_len_within_capacity() {
        let allocator = LocalAllocator::new(&[16]);
        let mut buf = allocator.alloc(4).unwrap();

        buf.set_len(16).unwrap();
        assert_eq!(buf.len(), 16);

        let error = buf.set_len(17).unwrap_err();
        assert!(matches!(error, AllocError::LengthOverflow { len: 17, capacity: 16 }));
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_full_write_then_fix_length() {
        let allocator = LocalAllocator::new(&[8]);
        let mut buf = allocator.alloc(0).unwrap();
        assert!(buf.is_empty());

        buf.as_full_mut()[..3].copy_from_slice(b"abc");
        buf.set_len(3).unwrap();
        assert_eq!(&buf[..], b"abc");

        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.as_full_mut().iter().all(|b| *b == 0));
    }
}
