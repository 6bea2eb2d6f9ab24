// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Create, cleanup and close handling for handles opened on the bus.
//!
//! Every entry point runs the same admission sequence:
//!
//! 1. Reject anything that is not the bus with
//!    [`DispatchStatus::InvalidDeviceRequest`]. The counter is not touched.
//! 2. Take an [`IoRef`](crate::IoRef) on the bus.
//! 3. Reject a removed bus with [`DispatchStatus::NoSuchDevice`]. The
//!    reference taken in step 2 is still released on the way out.
//!
//! Only then does the operation do its own work.

use alloc::sync::Arc;
use core::fmt;

use log::{info, warn};

use crate::{
    device::{BusDevice, ChildDevice, DeviceObject, UnplugError},
    event::Event,
    quiesce::IoRef,
    session::Session,
};

/// Outcome reported back to the I/O manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Success,
    /// The request targeted a device object other than the bus.
    InvalidDeviceRequest,
    /// The bus was already removed.
    NoSuchDevice,
}

impl DispatchStatus {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::InvalidDeviceRequest => "invalid device request",
            Self::NoSuchDevice => "no such device",
        })
    }
}

/// Removes a child from the bus's visible set.
///
/// Called from cleanup while the caller holds a reference on the bus, so an
/// implementation must not wait for the bus to drain.
pub trait Unplug<E: Event> {
    /// Marks `child` absent and detaches it from `bus`, addressing it by
    /// [`ChildDevice::port`].
    ///
    /// The port may have been freed and reused since cleanup looked at
    /// `child`; a device that is not `child` must be left plugged in.
    ///
    /// # Errors
    ///
    /// Whatever the implementation reports; cleanup logs it and carries on.
    fn unplug(&self, child: &Arc<ChildDevice>, bus: &BusDevice<E>) -> Result<(), UnplugError>;
}

/// Unplugs through the bus's own child list.
#[derive(Clone, Copy, Debug, Default)]
pub struct BusUnplug;

impl<E: Event> Unplug<E> for BusUnplug {
    fn unplug(&self, child: &Arc<ChildDevice>, bus: &BusDevice<E>) -> Result<(), UnplugError> {
        bus.unplug_child(child)
    }
}

fn admit<'a, E: Event>(
    device: &'a DeviceObject<E>,
    operation: &str,
) -> Result<IoRef<'a, E>, DispatchStatus> {
    // We only allow create/cleanup/close requests for the bus itself.
    let DeviceObject::Bus(bus) = device else {
        warn!("{operation}: invalid request on {:?} device", device.kind());
        return Err(DispatchStatus::InvalidDeviceRequest);
    };

    let io = bus.acquire();
    if io.is_deleted() {
        warn!("{operation}: no such device");
        return Err(DispatchStatus::NoSuchDevice);
    }

    Ok(io)
}

/// Handles a create (open) of the bus.
pub fn open<E: Event>(device: &DeviceObject<E>) -> DispatchStatus {
    match admit(device, "open") {
        Ok(_io) => DispatchStatus::Success,
        Err(status) => status,
    }
}

/// Handles the end of a session, which may come before the final close.
///
/// If the session plugged in a child, the binding is broken in both
/// directions and a child that is still present gets unplugged while the
/// bus reference is held.
pub fn cleanup<E: Event, U: Unplug<E>>(
    device: &DeviceObject<E>,
    session: &Session,
    unplug: &U,
) -> DispatchStatus {
    info!("cleanup: enter, session {}", session.id());

    let io = match admit(device, "cleanup") {
        Ok(io) => io,
        Err(status) => return status,
    };

    if let Some(child) = session.detach() {
        if child.is_present() {
            if let Err(err) = unplug.unplug(&child, &io) {
                warn!("cleanup: unplug of {} failed: {err}", child.port());
            }
        }
    }

    drop(io);
    info!("cleanup: leave, session {}", session.id());
    DispatchStatus::Success
}

/// Handles the final close of a handle on the bus.
pub fn close<E: Event>(device: &DeviceObject<E>) -> DispatchStatus {
    match admit(device, "close") {
        Ok(_io) => DispatchStatus::Success,
        Err(status) => status,
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::{sync::Arc, vec::Vec};

    use spin::Mutex;

    use super::*;
    use crate::{
        device::{PnpState, Port},
        event::SpinEvent,
        session::SessionId,
    };

    /// Records every call and then unplugs for real.
    #[derive(Default)]
    struct RecordingUnplug {
        calls: Mutex<Vec<Port>>,
    }

    impl Unplug<SpinEvent> for RecordingUnplug {
        fn unplug(
            &self,
            child: &Arc<ChildDevice>,
            bus: &BusDevice<SpinEvent>,
        ) -> Result<(), UnplugError> {
            // the caller must still be holding its reference
            assert!(bus.outstanding_io() >= 2);
            self.calls.lock().push(child.port());
            bus.unplug_child(child)
        }
    }

    fn live_bus() -> (Arc<BusDevice<SpinEvent>>, DeviceObject<SpinEvent>) {
        let bus = Arc::new(BusDevice::new());
        bus.common().set_pnp_state(PnpState::Started);
        let device = DeviceObject::Bus(Arc::clone(&bus));
        (bus, device)
    }

    fn removed_bus() -> (Arc<BusDevice<SpinEvent>>, DeviceObject<SpinEvent>) {
        let (bus, device) = live_bus();
        bus.common().set_pnp_state(PnpState::Deleted);
        (bus, device)
    }

    fn child_object(bus: &BusDevice<SpinEvent>) -> DeviceObject<SpinEvent> {
        let session = Session::new(SessionId(0xC0));
        DeviceObject::Child(bus.plug_in(Port(1), &session).unwrap())
    }

    #[test]
    fn open_cleanup_close_succeed_on_live_bus() {
        let (bus, device) = live_bus();
        let session = Session::new(SessionId(1));

        assert_eq!(open(&device), DispatchStatus::Success);
        assert_eq!(cleanup(&device, &session, &BusUnplug), DispatchStatus::Success);
        assert_eq!(close(&device), DispatchStatus::Success);

        assert_eq!(bus.outstanding_io(), 1);
        assert!(bus.is_stopped());
    }

    #[test]
    fn child_device_requests_are_invalid_and_leave_counter_alone() {
        let (bus, _) = live_bus();
        let child = child_object(&bus);
        let session = Session::new(SessionId(2));
        let unplug = RecordingUnplug::default();

        bus.io().stop_signal().clear();
        assert_eq!(open(&child), DispatchStatus::InvalidDeviceRequest);
        assert_eq!(cleanup(&child, &session, &unplug), DispatchStatus::InvalidDeviceRequest);
        assert_eq!(close(&child), DispatchStatus::InvalidDeviceRequest);

        assert_eq!(bus.outstanding_io(), 1);
        // no acquire/release happened, so the signal was not re-set either
        assert!(!bus.is_stopped());
        assert!(unplug.calls.lock().is_empty());
    }

    #[test]
    fn removed_bus_reports_no_such_device_with_balanced_counter() {
        let (bus, device) = removed_bus();
        let session = Session::new(SessionId(3));
        let unplug = RecordingUnplug::default();

        assert_eq!(open(&device), DispatchStatus::NoSuchDevice);
        assert_eq!(bus.outstanding_io(), 1);
        assert_eq!(cleanup(&device, &session, &unplug), DispatchStatus::NoSuchDevice);
        assert_eq!(bus.outstanding_io(), 1);
        assert_eq!(close(&device), DispatchStatus::NoSuchDevice);
        assert_eq!(bus.outstanding_io(), 1);

        assert!(unplug.calls.lock().is_empty());
        assert!(!bus.is_safe_to_destroy());
    }

    #[test]
    fn removed_bus_rejection_does_not_unbind_session() {
        let (bus, device) = live_bus();
        let session = Session::new(SessionId(4));
        let child = bus.plug_in(Port(6), &session).unwrap();
        bus.common().set_pnp_state(PnpState::Deleted);

        assert_eq!(cleanup(&device, &session, &BusUnplug), DispatchStatus::NoSuchDevice);
        assert_eq!(child.session(), Some(SessionId(4)));
        assert!(session.bound_child().is_some());
    }

    #[test]
    fn cleanup_unplugs_present_child_exactly_once() {
        let (bus, device) = live_bus();
        let session = Session::new(SessionId(5));
        let child = bus.plug_in(Port(4), &session).unwrap();
        let unplug = RecordingUnplug::default();

        assert_eq!(cleanup(&device, &session, &unplug), DispatchStatus::Success);

        assert_eq!(*unplug.calls.lock(), [Port(4)]);
        assert!(session.bound_child().is_none());
        assert_eq!(child.session(), None);
        assert!(!child.is_present());
        assert_eq!(bus.child_count(), 0);
        assert_eq!(bus.outstanding_io(), 1);

        // a second cleanup on the same session finds nothing to do
        assert_eq!(cleanup(&device, &session, &unplug), DispatchStatus::Success);
        assert_eq!(unplug.calls.lock().len(), 1);
    }

    #[test]
    fn cleanup_skips_unplug_for_absent_child() {
        let (bus, device) = live_bus();
        let session = Session::new(SessionId(6));
        let child = bus.plug_in(Port(2), &session).unwrap();
        bus.unplug_port(Port(2)).unwrap();
        let unplug = RecordingUnplug::default();

        assert_eq!(cleanup(&device, &session, &unplug), DispatchStatus::Success);

        assert!(unplug.calls.lock().is_empty());
        assert!(session.bound_child().is_none());
        assert_eq!(child.session(), None);
    }

    /// Between cleanup's presence check and its unplug, the port is unplugged
    /// out from under the session and another session plugs into it.
    struct PortReusedUnplug<'a> {
        newcomer: &'a Session,
        newcomer_child: Mutex<Option<Arc<ChildDevice>>>,
    }

    impl Unplug<SpinEvent> for PortReusedUnplug<'_> {
        fn unplug(
            &self,
            child: &Arc<ChildDevice>,
            bus: &BusDevice<SpinEvent>,
        ) -> Result<(), UnplugError> {
            bus.unplug_port(child.port())?;
            let newcomer = bus.plug_in(child.port(), self.newcomer).unwrap();
            *self.newcomer_child.lock() = Some(newcomer);

            BusUnplug.unplug(child, bus)
        }
    }

    #[test]
    fn cleanup_never_unplugs_a_device_plugged_into_a_reused_port() {
        let (bus, device) = live_bus();
        let leaving = Session::new(SessionId(9));
        let staying = Session::new(SessionId(10));
        bus.plug_in(Port(4), &leaving).unwrap();

        let unplug = PortReusedUnplug {
            newcomer: &staying,
            newcomer_child: Mutex::new(None),
        };
        assert_eq!(cleanup(&device, &leaving, &unplug), DispatchStatus::Success);

        let newcomer = unplug.newcomer_child.lock().take().unwrap();
        assert!(newcomer.is_present());
        assert!(Arc::ptr_eq(&bus.child(Port(4)).unwrap(), &newcomer));
        assert_eq!(newcomer.session(), Some(SessionId(10)));
        assert!(Arc::ptr_eq(&staying.bound_child().unwrap(), &newcomer));
        assert!(leaving.bound_child().is_none());
        assert_eq!(bus.outstanding_io(), 1);
    }

    #[test]
    fn cleanup_without_child_just_completes() {
        let (bus, device) = live_bus();
        let session = Session::new(SessionId(7));
        let unplug = RecordingUnplug::default();

        assert_eq!(cleanup(&device, &session, &unplug), DispatchStatus::Success);
        assert!(unplug.calls.lock().is_empty());
        assert_eq!(bus.outstanding_io(), 1);
    }

    #[test]
    fn failed_unplug_still_completes_cleanup() {
        struct FailingUnplug;
        impl Unplug<SpinEvent> for FailingUnplug {
            fn unplug(
                &self,
                child: &Arc<ChildDevice>,
                _: &BusDevice<SpinEvent>,
            ) -> Result<(), UnplugError> {
                Err(UnplugError::NoSuchPort(child.port()))
            }
        }

        let (bus, device) = live_bus();
        let session = Session::new(SessionId(8));
        bus.plug_in(Port(3), &session).unwrap();

        assert_eq!(cleanup(&device, &session, &FailingUnplug), DispatchStatus::Success);
        assert!(session.bound_child().is_none());
        assert_eq!(bus.outstanding_io(), 1);
    }

    #[test]
    fn status_reads_like_ntstatus_names() {
        assert!(DispatchStatus::Success.is_success());
        assert!(!DispatchStatus::NoSuchDevice.is_success());
        assert_eq!(
            std::format!("{}", DispatchStatus::InvalidDeviceRequest),
            "invalid device request"
        );
    }
}
