// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    fmt,
    ops::{Deref, DerefMut},
};

use spin::Mutex;

use crate::{
    device::Port,
    sync::{AtomicUsize, Ordering},
};

/// Tracking record for one USB request block in flight to the remote host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UrbRequest {
    /// Sequence number on the wire, never 0 once assigned.
    pub seq_num: u32,
    pub port: Option<Port>,
    /// Opaque handle of the originating I/O request.
    pub request: usize,
    pub sent: bool,
}

struct Shared<T> {
    free: Mutex<Vec<Box<T>>>,
    depth: usize,
    outstanding: AtomicUsize,
}

/// Fixed-size free list of request-tracking objects.
///
/// Up to `depth` released entries are kept for reuse; beyond that they are
/// freed. Safe to allocate from and release to on any thread.
pub struct Lookaside<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Default> Lookaside<T> {
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::with_capacity(depth)),
                depth,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Hands out a reset entry, reusing a cached one when available.
    pub fn allocate(&self) -> PoolEntry<T> {
        let cached = self.shared.free.lock().pop();
        let item = cached.map_or_else(
            || Box::new(T::default()),
            |mut item| {
                *item = T::default();
                item
            },
        );

        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        PoolEntry {
            item: Some(item),
            pool: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> Lookaside<T> {
    #[must_use]
    pub fn depth(&self) -> usize {
        self.shared.depth
    }

    /// Entries handed out and not yet returned.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Released entries waiting for reuse.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.shared.free.lock().len()
    }
}

impl<T> fmt::Debug for Lookaside<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookaside")
            .field("depth", &self.depth())
            .field("outstanding", &self.outstanding())
            .field("cached", &self.cached())
            .finish()
    }
}

/// An entry borrowed from a [`Lookaside`]; goes back to it on drop.
///
/// If the pool is gone by then, the entry is simply freed.
pub struct PoolEntry<T> {
    item: Option<Box<T>>,
    pool: Weak<Shared<T>>,
}

impl<T> Deref for PoolEntry<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // only vacated in drop
        self.item.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolEntry<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolEntry<T> {
    fn drop(&mut self) {
        let Some(item) = self.item.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        pool.outstanding.fetch_sub(1, Ordering::SeqCst);
        let mut free = pool.free.lock();
        if free.len() < pool.depth {
            free.push(item);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolEntry").field(&self.item).finish()
    }
}
