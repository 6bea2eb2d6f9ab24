// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use alloc::boxed::Box;
use core::cell::UnsafeCell;

use vhci_core::Event;
use wdk_sys::{
    ntddk::{KeClearEvent, KeInitializeEvent, KeReadStateEvent, KeSetEvent, KeWaitForSingleObject},
    KEVENT,
    KPRIORITY,
    KPROCESSOR_MODE,
    _EVENT_TYPE,
    _KWAIT_REASON,
    _MODE,
};

const IO_NO_INCREMENT: KPRIORITY = 0;

/// A notification (manual-reset) `KEVENT`.
///
/// The `KEVENT` is boxed so it keeps its address once initialized: its wait
/// list links back into itself.
pub struct KernelEvent {
    event: Box<UnsafeCell<KEVENT>>,
}

// SAFETY: KEVENTs are built to be signaled, cleared and waited on from any
// thread; all access goes through the Ke* routines.
unsafe impl Send for KernelEvent {}
// SAFETY: See above.
unsafe impl Sync for KernelEvent {}

impl Event for KernelEvent {
    fn new(signaled: bool) -> Self {
        let event = Box::new(UnsafeCell::new(KEVENT::default()));
        // SAFETY: The event memory is owned, boxed, and not yet shared.
        unsafe {
            KeInitializeEvent(
                event.get(),
                _EVENT_TYPE::NotificationEvent,
                u8::from(signaled),
            );
        }
        Self { event }
    }

    fn set(&self) {
        // SAFETY: The event was initialized in `new` and never moves.
        unsafe {
            KeSetEvent(self.event.get(), IO_NO_INCREMENT, u8::from(false));
        }
    }

    fn clear(&self) {
        // SAFETY: The event was initialized in `new` and never moves.
        unsafe {
            KeClearEvent(self.event.get());
        }
    }

    fn is_set(&self) -> bool {
        // SAFETY: The event was initialized in `new` and never moves.
        unsafe { KeReadStateEvent(self.event.get()) != 0 }
    }

    fn wait(&self) {
        // SAFETY: The event was initialized in `new` and never moves. Callers
        // wait at PASSIVE_LEVEL from PnP callbacks; no timeout, so the call
        // only returns once the event is signaled.
        unsafe {
            KeWaitForSingleObject(
                self.event.get().cast(),
                _KWAIT_REASON::Executive,
                _MODE::KernelMode as KPROCESSOR_MODE,
                u8::from(false),
                core::ptr::null_mut(),
            );
        }
    }
}
