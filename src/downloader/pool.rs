//! Connection admission pools
//!
//! A [`DownloadPool`] is a resizable counting semaphore. Every running chunk
//! holds one [`PoolSlot`] from its host pool and one from its account pool;
//! dropping the slot frees capacity and wakes one waiter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct PoolInner {
    name: String,
    /// (capacity, in use)
    counts: Mutex<(usize, usize)>,
    released: Notify,
}

/// Resizable connection pool
#[derive(Clone, Debug)]
pub struct DownloadPool {
    inner: Arc<PoolInner>,
}

impl DownloadPool {
    /// Pool with `capacity` concurrent slots
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                counts: Mutex::new((capacity, 0)),
                released: Notify::new(),
            }),
        }
    }

    /// Pool name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Maximum concurrent slots
    pub fn capacity(&self) -> usize {
        self.inner.counts.lock().0
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.inner.counts.lock().1
    }

    /// Whether a slot could be taken right now
    pub fn has_capacity(&self) -> bool {
        let (capacity, in_use) = *self.inner.counts.lock();
        in_use < capacity
    }

    /// Change the capacity
    ///
    /// Shrinking never interrupts held slots; new acquisitions simply wait
    /// until usage drops below the new capacity.
    pub fn resize(&self, capacity: usize) {
        let old = {
            let mut counts = self.inner.counts.lock();
            std::mem::replace(&mut counts.0, capacity)
        };
        if capacity != old {
            tracing::debug!(pool = %self.inner.name, old, new = capacity, "pool resized");
        }
        if capacity > old {
            self.inner.released.notify_waiters();
        }
    }

    /// Take a slot if one is free
    pub fn try_acquire(&self) -> Option<PoolSlot> {
        let mut counts = self.inner.counts.lock();
        if counts.1 < counts.0 {
            counts.1 += 1;
            Some(PoolSlot {
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    /// Wait until a slot is free and take it
    pub async fn acquire(&self) -> PoolSlot {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            // register before checking so a release in between is not missed
            released.as_mut().enable();
            if let Some(slot) = self.try_acquire() {
                return slot;
            }
            released.await;
        }
    }
}

/// One held connection slot, released on drop
#[derive(Debug)]
pub struct PoolSlot {
    inner: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        {
            let mut counts = self.inner.counts.lock();
            counts.1 = counts.1.saturating_sub(1);
        }
        self.inner.released.notify_one();
    }
}

/// Per-host pools created on first use
#[derive(Clone, Debug)]
pub struct HostPools {
    pools: Arc<Mutex<HashMap<String, DownloadPool>>>,
    default_capacity: usize,
}

impl HostPools {
    /// Registry whose pools start with `default_capacity` slots
    pub fn new(default_capacity: usize) -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Pool for `host`, created on demand
    pub fn pool_for(&self, host: &str) -> DownloadPool {
        self.pools
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| DownloadPool::new(host, self.default_capacity))
            .clone()
    }

    /// Resize the pool of `host`
    pub fn resize(&self, host: &str, capacity: usize) {
        self.pool_for(host).resize(capacity);
    }
}
