// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Outstanding-I/O accounting for the bus device.
//!
//! The counter is 1-biased: an idle, live bus rests at 1. Every entry point
//! that touches the bus holds an [`IoRef`] for the duration of its work, which
//! lifts the counter above 1. Two level-triggered signals hang off the
//! counter:
//!
//! * *stopped* is cleared on the 1 -> 2 transition and set on the 2 -> 1
//!   transition. A pending stop waits on it to know the bus is drained.
//! * *safe-to-destroy* is set on the single transition to 0, which can only
//!   happen after the bus is `Deleted` and the bias itself was released.
//!
//! A counter step and the signal update it triggers happen under one short
//! lock, so an observer never sees *stopped* set while a reference beyond the
//! bias is held, nor clear while the counter rests at 1. Waiting happens
//! outside the lock. Snapshots read the counter without taking it.

use core::{fmt, mem, ops::Deref};

use log::{debug, trace};

use crate::{
    device::{BusDevice, DeviceCommon, PnpState},
    event::Event,
    sync::{AtomicBool, AtomicI32, Mutex, Ordering},
};

/// Which side of the bias the counter landed on after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The bias itself is gone: the bus may be freed.
    Draining,
    /// Only the bias is left: nothing is in flight.
    Idle,
    /// Work beyond the bias is still in flight.
    Active,
}

impl Transition {
    const fn from_count(count: i32) -> Self {
        match count {
            0 => Self::Draining,
            1 => Self::Idle,
            _ => Self::Active,
        }
    }
}

pub(crate) struct OutstandingIo<E> {
    // Written only while `transition` is held.
    count: AtomicI32,
    transition: Mutex<()>,
    bias_held: AtomicBool,
    destroy_signaled: AtomicBool,
    stop: E,
    remove: E,
}

impl<E: Event> OutstandingIo<E> {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicI32::new(1),
            transition: Mutex::new(()),
            bias_held: AtomicBool::new(true),
            destroy_signaled: AtomicBool::new(false),
            // idle at creation, so the bus already reads as stopped
            stop: E::new(true),
            remove: E::new(false),
        }
    }

    pub(crate) fn count(&self) -> i32 {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) const fn stop_signal(&self) -> &E {
        &self.stop
    }

    pub(crate) const fn remove_signal(&self) -> &E {
        &self.remove
    }

    pub(crate) fn increment(&self) -> Transition {
        let transition = self.transition.lock();
        let result = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        contract_assert!(result > 0, "outstanding I/O went to {result} on acquire");

        // Only the first acquirer beyond the bias clears the stop signal.
        if result == 2 {
            self.stop.clear();
        }
        drop(transition);

        trace!("outstanding I/O +1 -> {result}");
        Transition::from_count(result)
    }

    pub(crate) fn decrement(&self, common: &DeviceCommon) -> Transition {
        let transition = self.transition.lock();
        let result = self.count.fetch_sub(1, Ordering::SeqCst) - 1;

        contract_assert!(result >= 0, "outstanding I/O went to {result} on release");

        match result {
            1 => self.stop.set(),
            0 => {
                // The count is 1-biased: zero means the extra decrement for
                // removal has been done.
                let state = common.pnp_state();
                contract_assert!(
                    state == PnpState::Deleted,
                    "outstanding I/O drained while bus is {state:?}"
                );

                if self.destroy_signaled.swap(true, Ordering::SeqCst) {
                    debug!("late request drained a removed bus again");
                } else {
                    self.remove.set();
                }
            }
            _ => {}
        }
        drop(transition);

        trace!("outstanding I/O -1 -> {result}");
        Transition::from_count(result)
    }

    /// Counter value and stopped signal read as one consistent pair.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (i32, bool) {
        let _transition = self.transition.lock();
        (self.count.load(Ordering::SeqCst), self.stop.is_set())
    }

    pub(crate) fn surrender_bias(&self) -> bool {
        self.bias_held.swap(false, Ordering::SeqCst)
    }
}

impl<E> fmt::Debug for OutstandingIo<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutstandingIo")
            .field("count", &self.count.load(Ordering::SeqCst))
            .field("bias_held", &self.bias_held.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// A counted reference on the bus's outstanding I/O.
///
/// Obtained from [`BusDevice::acquire`]. Dropping it releases the reference
/// exactly once, whichever way the holder leaves.
#[must_use = "dropping the reference releases it immediately"]
pub struct IoRef<'a, E: Event> {
    bus: &'a BusDevice<E>,
}

impl<'a, E: Event> IoRef<'a, E> {
    pub(crate) const fn new(bus: &'a BusDevice<E>) -> Self {
        Self { bus }
    }

    /// Whether the bus had already been removed when looked at.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.bus.common().pnp_state() == PnpState::Deleted
    }

    /// Releases the reference now and reports where the counter landed.
    #[allow(clippy::must_use_candidate)]
    pub fn release(self) -> Transition {
        let bus = self.bus;
        mem::forget(self);
        bus.io().decrement(bus.common())
    }

    /// Waits for every other holder to leave before a stop is honored.
    ///
    /// Marks the bus `StopPending`, gives up this reference, waits for the
    /// stopped signal and then re-acquires. The caller moves the bus to
    /// `Stopped` once it is done.
    pub fn drain_for_stop(self) -> Self {
        let bus = self.bus;

        bus.common().set_pnp_state(PnpState::StopPending);
        self.release();

        debug!("waiting for outstanding I/O to drain before stop");
        bus.io().stop_signal().wait();

        bus.acquire()
    }

    /// Tears the bus down on removal.
    ///
    /// Marks the bus `Deleted`, unplugs every child still present, gives up
    /// this reference, drops the bias and waits until the last holder is gone.
    /// The bus may be freed once this returns.
    pub fn remove_and_drain(self) {
        let bus = self.bus;

        bus.common().set_pnp_state(PnpState::Deleted);

        let unplugged = bus.unplug_all();
        if unplugged != 0 {
            debug!("unplugged {unplugged} child device(s) on bus removal");
        }

        self.release();
        bus.release_bias();

        debug!("waiting for outstanding I/O to drain before removal");
        bus.io().remove_signal().wait();
    }
}

impl<E: Event> Deref for IoRef<'_, E> {
    type Target = BusDevice<E>;

    fn deref(&self) -> &Self::Target {
        self.bus
    }
}

impl<E: Event> Drop for IoRef<'_, E> {
    fn drop(&mut self) {
        self.bus.io().decrement(self.bus.common());
    }
}

impl<E: Event> fmt::Debug for IoRef<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRef")
            .field("outstanding_io", &self.bus.outstanding_io())
            .finish()
    }
}
