//! Buffer provider: static per-connection buffers, a shared pool of large
//! buffers for oversized messages, and a size-capped dynamic fallback.
//!
//! Modeled as a small state machine per borrow (pool-owned vs. heap-owned).
//! The tag lives on [`BorrowedBuffer`] itself, so `release` doesn't need a
//! side table to know where a buffer came from.

use bytes::BytesMut;
use log::trace;
use std::sync::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct BufferProviderConfig {
    /// Size of each buffer in the shared large-buffer pool.
    pub large_buffer_size: usize,
    /// Number of buffers kept in the shared pool.
    pub large_buffer_count: usize,
    /// Ceiling on any single acquire, pooled or dynamic.
    pub max_message_size: usize,
}

impl Default for BufferProviderConfig {
    fn default() -> Self {
        let max_message_size = 65536;
        BufferProviderConfig {
            large_buffer_size: max_message_size,
            large_buffer_count: 8,
            max_message_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Pool,
    Heap,
}

/// A buffer acquired from a [`BufferProvider`]. Must be returned via
/// [`BufferProvider::release`] exactly once; dropping it without releasing
/// leaks pool capacity (the pool free-list simply never grows back), which is
/// why [`crate::message::MessageReader`] always routes completion and abort
/// paths through `release`.
pub struct BorrowedBuffer {
    pub buf: BytesMut,
    owner: Owner,
}

impl BorrowedBuffer {
    fn pool(buf: BytesMut) -> Self {
        Self { buf, owner: Owner::Pool }
    }

    fn heap(buf: BytesMut) -> Self {
        Self { buf, owner: Owner::Heap }
    }
}

/// Allocates the fixed per-connection static buffer (tier (i)). Not pooled;
/// it's embedded directly in the reader and lives for the connection's
/// lifetime.
pub fn static_buffer(size: usize) -> BytesMut {
    BytesMut::with_capacity(size)
}

/// Tiers (ii) and (iii): a mutex-guarded free list of fixed-size buffers,
/// falling back to dynamic allocation up to `max_message_size`.
pub struct BufferProvider {
    free: Mutex<Vec<BytesMut>>,
    large_buffer_size: usize,
    max_message_size: usize,
}

impl BufferProvider {
    pub fn new(cfg: BufferProviderConfig) -> Self {
        let mut free = Vec::with_capacity(cfg.large_buffer_count);
        for _ in 0..cfg.large_buffer_count {
            free.push(BytesMut::with_capacity(cfg.large_buffer_size));
        }
        BufferProvider {
            free: Mutex::new(free),
            large_buffer_size: cfg.large_buffer_size,
            max_message_size: cfg.max_message_size,
        }
    }

    /// Acquires a buffer able to hold at least `size` bytes.
    ///
    /// Pops a pooled buffer when `size` fits within the pooled size and one is
    /// free; otherwise allocates dynamically as long as `size` is within
    /// `max_message_size`; otherwise fails.
    pub fn acquire(&self, size: usize) -> Result<BorrowedBuffer, Error> {
        if size <= self.large_buffer_size {
            let mut free = self.free.lock().expect("buffer pool mutex poisoned");
            if let Some(mut buf) = free.pop() {
                buf.clear();
                trace!(target: "wsendpoint::buffer", "acquired pooled buffer ({} left)", free.len());
                return Ok(BorrowedBuffer::pool(buf));
            }
        }

        if size <= self.max_message_size {
            trace!(target: "wsendpoint::buffer", "pool exhausted or oversized, allocating {size} bytes on heap");
            return Ok(BorrowedBuffer::heap(BytesMut::with_capacity(size)));
        }

        Err(Error::BufferRequestTooLarge)
    }

    /// Releases a previously acquired buffer. Pool-owned buffers go back on
    /// the free list (capped implicitly, since only buffers this provider
    /// itself handed out ever re-enter it); heap-owned buffers are simply
    /// dropped.
    pub fn release(&self, buffer: BorrowedBuffer) {
        if buffer.owner == Owner::Pool {
            let mut free = self.free.lock().expect("buffer pool mutex poisoned");
            free.push(buffer.buf);
        }
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_preserves_pool_count() {
        let provider = BufferProvider::new(BufferProviderConfig {
            large_buffer_size: 1024,
            large_buffer_count: 2,
            max_message_size: 4096,
        });
        assert_eq!(provider.free_count(), 2);
        let b = provider.acquire(512).unwrap();
        assert_eq!(provider.free_count(), 1);
        provider.release(b);
        assert_eq!(provider.free_count(), 2);
    }

    #[test]
    fn exhausted_pool_falls_back_to_heap() {
        let provider = BufferProvider::new(BufferProviderConfig {
            large_buffer_size: 1024,
            large_buffer_count: 1,
            max_message_size: 4096,
        });
        let a = provider.acquire(512).unwrap();
        let b = provider.acquire(512).unwrap();
        assert_eq!(provider.free_count(), 0);
        provider.release(a);
        assert_eq!(provider.free_count(), 1);
        provider.release(b); // heap-owned, dropped, pool count unaffected
        assert_eq!(provider.free_count(), 1);
    }

    #[test]
    fn over_max_message_size_is_rejected() {
        let provider = BufferProvider::new(BufferProviderConfig {
            large_buffer_size: 1024,
            large_buffer_count: 1,
            max_message_size: 2048,
        });
        assert!(provider.acquire(4096).is_err());
    }
}
