// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Create, cleanup and close of handles on the bus.
//!
//! Each handle owns a [`Session`] in its file object context. The requests
//! themselves are admitted or refused by `vhci_core::gate`; this module only
//! finds the device and session behind the framework handles.

use alloc::sync::Arc;

use vhci_core::{
    gate::{self, DispatchStatus, Unplug},
    BusDevice,
    ChildDevice,
    Session,
    SessionId,
    UnplugError,
};
use wdk::println;
use wdk_sys::{
    call_unsafe_wdf_function_binding,
    ntddk::IoInvalidateDeviceRelations,
    NTSTATUS,
    STATUS_INVALID_DEVICE_REQUEST,
    STATUS_NO_SUCH_DEVICE,
    STATUS_SUCCESS,
    WDFDEVICE,
    WDFFILEOBJECT,
    WDFOBJECT,
    WDFREQUEST,
    _DEVICE_RELATION_TYPE,
};

use crate::{
    device::device_object,
    event::KernelEvent,
    file_get_context,
    wdf_object_context::context_init,
    FileContext,
};

const fn to_nt_status(status: DispatchStatus) -> NTSTATUS {
    match status {
        DispatchStatus::Success => STATUS_SUCCESS,
        DispatchStatus::InvalidDeviceRequest => STATUS_INVALID_DEVICE_REQUEST,
        DispatchStatus::NoSuchDevice => STATUS_NO_SUCH_DEVICE,
    }
}

/// Unplugs from the bus model, then has `PnP` re-enumerate the bus so the
/// child's device stack is torn down.
struct PnpUnplug {
    device: WDFDEVICE,
}

impl Unplug<KernelEvent> for PnpUnplug {
    fn unplug(
        &self,
        child: &Arc<ChildDevice>,
        bus: &BusDevice<KernelEvent>,
    ) -> Result<(), UnplugError> {
        bus.unplug_child(child)?;

        // SAFETY: `device` is the live bus device the cleanup arrived on.
        unsafe {
            let pdo = call_unsafe_wdf_function_binding!(WdfDeviceWdmGetPhysicalDevice, self.device);
            IoInvalidateDeviceRelations(pdo, _DEVICE_RELATION_TYPE::BusRelations);
        }
        Ok(())
    }
}

unsafe fn file_device(file_object: WDFFILEOBJECT) -> WDFDEVICE {
    // SAFETY: Upheld by the caller.
    unsafe { call_unsafe_wdf_function_binding!(WdfFileObjectGetDevice, file_object) }
}

unsafe fn file_session<'a>(file_object: WDFFILEOBJECT) -> &'a Session {
    // SAFETY: Upheld by the caller.
    unsafe { &(*file_get_context(file_object as WDFOBJECT)).session }
}

/// `EvtDeviceFileCreate` is called when user mode opens a handle on the bus.
///
/// The session is set up before the gate decides, so the file object's
/// destroy callback always finds an initialized context.
///
/// # Arguments:
///
/// * `device` - Handle to the bus device
/// * `request` - Handle to the create request
/// * `file_object` - Handle to the new file object
pub extern "C" fn vhci_evt_device_file_create(
    device: WDFDEVICE,
    request: WDFREQUEST,
    file_object: WDFFILEOBJECT,
) {
    // SAFETY: The framework passes a fresh file object whose context was
    // allocated with the attributes set in vhci_evt_device_add.
    unsafe {
        context_init(
            file_get_context(file_object as WDFOBJECT),
            FileContext {
                session: Session::new(SessionId(file_object as u64)),
            },
        );
    }

    // SAFETY: `device` was created by vhci_evt_device_add.
    let status = gate::open(unsafe { device_object(device) });
    if !status.is_success() {
        println!("vhci_evt_device_file_create: {status}");
    }

    unsafe {
        call_unsafe_wdf_function_binding!(WdfRequestComplete, request, to_nt_status(status));
    }
}

/// `EvtFileCleanup` is called when the last handle to the file object is
/// closed. Whatever the session plugged in is unplugged here.
///
/// # Arguments:
///
/// * `file_object` - Handle to the file object being cleaned up
pub extern "C" fn vhci_evt_file_cleanup(file_object: WDFFILEOBJECT) {
    // SAFETY: Cleanup only runs for file objects whose create callback ran.
    let (device, session) = unsafe { (file_device(file_object), file_session(file_object)) };

    // SAFETY: `device` was created by vhci_evt_device_add.
    let status = gate::cleanup(
        unsafe { device_object(device) },
        session,
        &PnpUnplug { device },
    );
    if !status.is_success() {
        println!("vhci_evt_file_cleanup: {status}");
    }
}

/// `EvtFileClose` is called once every request on the file object has
/// completed.
///
/// # Arguments:
///
/// * `file_object` - Handle to the file object being closed
pub extern "C" fn vhci_evt_file_close(file_object: WDFFILEOBJECT) {
    // SAFETY: Close only runs for file objects whose create callback ran.
    let device = unsafe { file_device(file_object) };

    // SAFETY: `device` was created by vhci_evt_device_add.
    let status = gate::close(unsafe { device_object(device) });
    if !status.is_success() {
        println!("vhci_evt_file_close: {status}");
    }
}
