//! Reusable byte buffers for encoding request bodies.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Number of idle buffers kept by default.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Buffers that grew beyond this capacity are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// A bounded, thread-safe pool of byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
        }
    }

    /// Takes an empty buffer from the pool, allocating one if none is idle.
    /// The buffer goes back to the pool when the guard is dropped.
    pub fn get(&self) -> PooledBuffer<'_> {
        let mut buf = self.idle.lock().pop().unwrap_or_default();
        buf.clear();
        PooledBuffer { pool: self, buf }
    }

    /// Number of buffers currently waiting in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
