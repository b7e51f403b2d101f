//! Fixed size-class buffer pools.
//!
//! A [`BufferAllocator`] owns one free list per declared size. Callers get a
//! [`PoolBuf`] back from [`BufferAllocator::alloc`]; the handle is move-only
//! and returns its memory to the originating free list when dropped.
//!
//! ```
//! use micro_net::buffer::SharedAllocator;
//!
//! let allocator = SharedAllocator::new(&[32, 64, 256]);
//! let mut buf = allocator.alloc(40).unwrap();
//! assert_eq!(buf.capacity(), 64);
//! assert!(buf.iter().all(|b| *b == 0));
//! buf[0] = b'x';
//! drop(buf); // back on the 64 byte free list
//! assert_eq!(allocator.available(64), allocator.created(64));
//! ```

mod allocator;
mod pool_buf;

pub use allocator::BufferAllocator;
pub use allocator::DEFAULT_EXPAND_BATCH;
pub use allocator::FreeList;
pub use allocator::FreeListLock;
pub use allocator::LocalAllocator;
pub use allocator::LocalLock;
pub use allocator::SharedAllocator;
pub use allocator::SharedLock;
pub use pool_buf::PoolBuf;

/// Size classes of the session allocator. The small classes hold typical
/// request-sized packets, the large ones a full `MAX_PACKET_SIZE` packet.
pub const SESSION_SIZE_CLASSES: [usize; 8] = [32, 64, 256, 512, 1024, 4 * 1024, 16 * 1024, 65535];
