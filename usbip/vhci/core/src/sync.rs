// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Atomics and the short lock used by the quiescence protocol.
//!
//! Under `cfg(loom)` these resolve to loom's model-checked primitives so the
//! counter/signal interleavings can be explored exhaustively.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use spin::Mutex;

/// `spin::Mutex` surface over loom's mutex. A spinning lock built on plain
/// atomics would never yield to loom's scheduler.
#[cfg(loom)]
pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

#[cfg(loom)]
impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(loom::sync::Mutex::new(value))
    }

    pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Backs off inside a busy-wait loop.
#[inline]
pub(crate) fn spin_wait() {
    #[cfg(loom)]
    loom::thread::yield_now();

    #[cfg(not(loom))]
    core::hint::spin_loop();
}
