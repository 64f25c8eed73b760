// MIT License - Copyright (c) 2021 TJForc

//! Bounded object pools for receive buffers and protocol readers.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

/// A bounded, thread-safe pool of reusable objects.
///
/// `get` hands out a pooled instance or builds a fresh one; `release` returns
/// it, dropping it when the pool is already full.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> Pool<T> {
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
        }
    }

    pub fn get(&self) -> T {
        let pooled = self.items.lock().pop();
        pooled.unwrap_or_else(|| (self.factory)())
    }

    pub fn release(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Number of idle objects currently held.
    pub fn idle(&self) -> usize {
        self.items.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

const BUFFER_POOL_CAPACITY: usize = 64;

/// Pool of zeroed byte buffers of one fixed size.
pub struct BufferPool {
    size: usize,
    pool: Pool<Vec<u8>>,
}

static SHARED_BUFFER_POOLS: LazyLock<Mutex<HashMap<usize, Arc<BufferPool>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl BufferPool {
    pub fn new(size: usize, capacity: usize) -> Self {
        Self {
            size,
            pool: Pool::new(capacity, move || vec![0u8; size]),
        }
    }

    /// Process-wide pool for buffers of `size` bytes, created on first use.
    pub fn shared(size: usize) -> Arc<BufferPool> {
        SHARED_BUFFER_POOLS
            .lock()
            .entry(size)
            .or_insert_with(|| Arc::new(BufferPool::new(size, BUFFER_POOL_CAPACITY)))
            .clone()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.pool.get()
    }

    /// Return a buffer. Buffers of the wrong length are discarded.
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.len() == self.size {
            self.pool.release(buffer);
        }
    }

    pub fn idle(&self) -> usize {
        self.pool.idle()
    }
}
