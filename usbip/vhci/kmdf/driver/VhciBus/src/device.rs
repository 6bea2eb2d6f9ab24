// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use log::info;
use vhci_core::{BusDevice, DeviceObject, PnpState};
use wdk::{nt_success, paged_code, println};
use wdk_sys::{
    call_unsafe_wdf_function_binding,
    ntddk::KeGetCurrentIrql,
    APC_LEVEL,
    NTSTATUS,
    STATUS_INVALID_DEVICE_STATE,
    STATUS_SUCCESS,
    WDFDEVICE,
    WDFDEVICE_INIT,
    WDFDRIVER,
    WDFOBJECT,
    WDF_FILEOBJECT_CONFIG,
    WDF_NO_HANDLE,
    WDF_PNPPOWER_EVENT_CALLBACKS,
    _WDF_FILEOBJECT_CLASS,
    _WDF_TRI_STATE,
};

use crate::{
    device_get_context,
    driver_get_globals,
    event::KernelEvent,
    file,
    file_get_context,
    wdf_object_context::{
        context_attributes,
        context_init,
        destroy_callback,
        wdf_get_context_type_info,
    },
    DeviceContext,
    FileContext,
    GUID_DEVINTERFACE_VHCI_USBIP,
    WDF_FILEOBJECT_CONFIG_SIZE,
    WDF_PNPPOWER_EVENT_CALLBACKS_SIZE,
};

/// Looks up the device object model behind a framework device.
///
/// # Safety
///
/// `device` must be a device created by [`vhci_evt_device_add`], whose
/// context stays initialized until its destroy callback runs.
pub unsafe fn device_object<'a>(device: WDFDEVICE) -> &'a DeviceObject<KernelEvent> {
    // SAFETY: Upheld by the caller.
    unsafe { &(*device_get_context(device as WDFOBJECT)).device }
}

/// Only the bus carries PnP callbacks, so this is the bus behind `device`.
unsafe fn bus<'a>(device: WDFDEVICE) -> Option<&'a BusDevice<KernelEvent>> {
    // SAFETY: Upheld by the caller.
    unsafe { device_object(device) }.as_bus().map(|bus| bus.as_ref())
}

/// `EvtDeviceAdd` is called by the framework in response to `AddDevice`
/// call from the `PnP` manager. We create the bus device object, hook the
/// file object callbacks that make up the admission gate, and publish the
/// device interface user mode opens.
///
/// # Arguments:
///
/// * `driver` - Handle to a framework driver object created in `DriverEntry`
/// * `device_init` - Pointer to a framework-allocated `WDFDEVICE_INIT`
///   structure.
///
/// # Return value:
///
///   * `NTSTATUS`
#[link_section = "PAGE"]
pub extern "C" fn vhci_evt_device_add(
    driver: WDFDRIVER,
    mut device_init: *mut WDFDEVICE_INIT,
) -> NTSTATUS {
    paged_code!();

    println!("Enter: vhci_evt_device_add");

    // SAFETY: The driver context was initialized in DriverEntry and is only
    // emptied at unload, after every device is gone.
    let Some(driver_context) = (unsafe { &*driver_get_globals(driver as WDFOBJECT) })
        .context
        .as_ref()
    else {
        return STATUS_INVALID_DEVICE_STATE;
    };

    let mut pnp_power_callbacks = WDF_PNPPOWER_EVENT_CALLBACKS {
        Size: WDF_PNPPOWER_EVENT_CALLBACKS_SIZE,
        EvtDeviceSelfManagedIoInit: Some(vhci_evt_self_managed_io_init),
        EvtDeviceSelfManagedIoSuspend: Some(vhci_evt_self_managed_io_suspend),
        EvtDeviceSelfManagedIoRestart: Some(vhci_evt_self_managed_io_restart),
        EvtDeviceSelfManagedIoCleanup: Some(vhci_evt_self_managed_io_cleanup),
        ..WDF_PNPPOWER_EVENT_CALLBACKS::default()
    };

    unsafe {
        call_unsafe_wdf_function_binding!(
            WdfDeviceInitSetPnpPowerEventCallbacks,
            device_init,
            &raw mut pnp_power_callbacks,
        );
    }

    let mut file_config = WDF_FILEOBJECT_CONFIG {
        Size: WDF_FILEOBJECT_CONFIG_SIZE,
        EvtDeviceFileCreate: Some(file::vhci_evt_device_file_create),
        EvtFileClose: Some(file::vhci_evt_file_close),
        EvtFileCleanup: Some(file::vhci_evt_file_cleanup),
        AutoForwardCleanupClose: _WDF_TRI_STATE::WdfUseDefault,
        FileObjectClass: _WDF_FILEOBJECT_CLASS::WdfFileObjectWdfCanUseFsContext,
        ..WDF_FILEOBJECT_CONFIG::default()
    };

    let mut file_attributes = context_attributes(
        wdf_get_context_type_info!(FileContext),
        None,
        Some(vhci_evt_file_context_destroy),
    );

    unsafe {
        call_unsafe_wdf_function_binding!(
            WdfDeviceInitSetFileObjectConfig,
            device_init,
            &raw mut file_config,
            &raw mut file_attributes,
        );
    }

    let mut attributes = context_attributes(
        wdf_get_context_type_info!(DeviceContext),
        None,
        Some(vhci_evt_device_context_destroy),
    );

    let mut device = WDF_NO_HANDLE as WDFDEVICE;
    let mut nt_status = unsafe {
        call_unsafe_wdf_function_binding!(
            WdfDeviceCreate,
            &raw mut device_init,
            &raw mut attributes,
            &raw mut device,
        )
    };

    if !nt_success(nt_status) {
        println!("Error: WdfDeviceCreate failed {nt_status:#010X}");
        return nt_status;
    }

    // SAFETY: The device was just created with a `DeviceContext`, which
    // nothing has touched yet.
    unsafe {
        context_init(
            device_get_context(device as WDFOBJECT),
            DeviceContext {
                device: DeviceObject::Bus(driver_context.create_bus()),
            },
        );
    }

    nt_status = unsafe {
        call_unsafe_wdf_function_binding!(
            WdfDeviceCreateDeviceInterface,
            device,
            &GUID_DEVINTERFACE_VHCI_USBIP,
            core::ptr::null_mut(),
        )
    };

    if !nt_success(nt_status) {
        println!("Error: WdfDeviceCreateDeviceInterface failed {nt_status:#010X}");
        return nt_status;
    }

    println!("Exit: vhci_evt_device_add");

    nt_status
}

/// The bus is started: admit requests.
#[link_section = "PAGE"]
extern "C" fn vhci_evt_self_managed_io_init(device: WDFDEVICE) -> NTSTATUS {
    paged_code!();

    // SAFETY: Only registered on devices created by vhci_evt_device_add.
    if let Some(bus) = unsafe { bus(device) } {
        bus.common().set_pnp_state(PnpState::Started);
    }
    STATUS_SUCCESS
}

/// The bus is being stopped or powered down: wait out in-flight requests.
#[link_section = "PAGE"]
extern "C" fn vhci_evt_self_managed_io_suspend(device: WDFDEVICE) -> NTSTATUS {
    paged_code!();

    // SAFETY: Only registered on devices created by vhci_evt_device_add.
    if let Some(bus) = unsafe { bus(device) } {
        let io = bus.acquire().drain_for_stop();
        bus.common().set_pnp_state(PnpState::Stopped);
        drop(io);
        info!("bus stopped");
    }
    STATUS_SUCCESS
}

#[link_section = "PAGE"]
extern "C" fn vhci_evt_self_managed_io_restart(device: WDFDEVICE) -> NTSTATUS {
    paged_code!();

    // SAFETY: Only registered on devices created by vhci_evt_device_add.
    if let Some(bus) = unsafe { bus(device) } {
        bus.common().set_pnp_state(PnpState::Started);
    }
    STATUS_SUCCESS
}

/// The bus is being removed: unplug everything and wait until the last
/// request holding the bus has left. The context may be freed afterwards.
#[link_section = "PAGE"]
extern "C" fn vhci_evt_self_managed_io_cleanup(device: WDFDEVICE) {
    paged_code!();

    // SAFETY: Only registered on devices created by vhci_evt_device_add.
    if let Some(bus) = unsafe { bus(device) } {
        bus.acquire().remove_and_drain();
        info!("bus removed, outstanding I/O drained");
    }
}

extern "C" fn vhci_evt_device_context_destroy(object: WDFOBJECT) {
    destroy_callback(object, device_get_context);
}

extern "C" fn vhci_evt_file_context_destroy(object: WDFOBJECT) {
    destroy_callback(object, file_get_context);
}
