// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use crate::sync::{spin_wait, AtomicBool, Ordering};

/// A manual-reset, level-triggered signal.
///
/// Once set, the signal stays set until [`Event::clear`] is called, so a
/// waiter that shows up late still observes it. The quiescence protocol only
/// sets and clears; the PnP side is the one that waits.
///
/// The driver backs this with a notification `KEVENT`. [`SpinEvent`] is the
/// portable implementation.
pub trait Event: Send + Sync {
    /// Creates the event in the given initial state.
    fn new(signaled: bool) -> Self
    where
        Self: Sized;

    /// Signals the event. Idempotent.
    fn set(&self);

    /// Returns the event to the unsignaled state. Idempotent.
    fn clear(&self);

    /// Reads the current state without waiting.
    fn is_set(&self) -> bool;

    /// Blocks the calling thread until the event is signaled.
    fn wait(&self);
}

/// Level-triggered flag that waits by spinning.
#[derive(Debug)]
pub struct SpinEvent {
    signaled: AtomicBool,
}

impl Default for SpinEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Event for SpinEvent {
    fn new(signaled: bool) -> Self {
        Self {
            signaled: AtomicBool::new(signaled),
        }
    }

    fn set(&self) {
        self.signaled.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.signaled.store(false, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    fn wait(&self) {
        while !self.is_set() {
            spin_wait();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn stays_set_until_cleared() {
        let event = SpinEvent::default();
        assert!(!event.is_set());

        event.set();
        event.set();
        assert!(event.is_set());
        // a second look is not consumed by the first
        assert!(event.is_set());

        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn late_waiter_observes_earlier_set() {
        let event = SpinEvent::new(false);
        event.set();
        event.wait();
        assert!(event.is_set());
    }

    #[test]
    fn wait_returns_once_another_thread_sets() {
        let event = Arc::new(SpinEvent::default());
        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.set())
        };

        event.wait();
        setter.join().unwrap();
        assert!(event.is_set());
    }
}
