// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use core::slice;

use vhci_core::{DriverContext, LoadError};
use wdk::{nt_success, println};
use wdk_sys::{
    call_unsafe_wdf_function_binding,
    DRIVER_OBJECT,
    NTSTATUS,
    PCUNICODE_STRING,
    PDRIVER_OBJECT,
    STATUS_INSUFFICIENT_RESOURCES,
    WDFDRIVER,
    WDFOBJECT,
    WDF_DRIVER_CONFIG,
    WDF_NO_HANDLE,
};

use crate::{
    device,
    driver_get_globals,
    logger,
    wdf_object_context::{context_attributes, context_init, wdf_get_context_type_info},
    DriverGlobals,
    WDF_DRIVER_CONFIG_SIZE,
    WDF_DRIVER_GLOBALS_TYPE_INFO,
};

/// `DriverEntry` initializes the driver and is the first routine called by the
/// system after the driver is loaded. `DriverEntry` specifies the other entry
/// points in the function driver, such as `EvtDevice` and `DriverUnload`.
///
/// The registry path is copied into driver-owned memory and the URB lookaside
/// is set up before the framework driver object is created, so a failed
/// allocation leaves nothing behind.
///
/// # Arguments
///
/// * `driver` - represents the instance of the function driver that is loaded
///   into memory.
/// * `registry_path` - represents the driver specific path in the Registry.
///
/// # Return value:
///
/// * `STATUS_SUCCESS` - if successful,
/// * `STATUS_INSUFFICIENT_RESOURCES` - if the registry path could not be
///   copied,
/// * the failing status of `WdfDriverCreate` - otherwise.
#[link_section = "INIT"]
#[export_name = "DriverEntry"] // WDF expects a symbol with the name DriverEntry
extern "system" fn driver_entry(
    driver: &mut DRIVER_OBJECT,
    registry_path: PCUNICODE_STRING,
) -> NTSTATUS {
    logger::init();

    println!("Enter: driver_entry");

    let context = match load_driver_context(registry_path) {
        Ok(context) => context,
        Err(LoadError::InsufficientResources) => {
            println!("Error: driver context allocation failed");
            return STATUS_INSUFFICIENT_RESOURCES;
        }
    };

    let mut driver_config = WDF_DRIVER_CONFIG {
        Size: WDF_DRIVER_CONFIG_SIZE,
        EvtDriverDeviceAdd: Some(device::vhci_evt_device_add),
        EvtDriverUnload: Some(vhci_evt_driver_unload),
        ..WDF_DRIVER_CONFIG::default()
    };

    let mut attributes = context_attributes(
        wdf_get_context_type_info!(DriverGlobals),
        None,
        None,
    );

    let mut driver_handle = WDF_NO_HANDLE as WDFDRIVER;

    let nt_status = unsafe {
        call_unsafe_wdf_function_binding!(
            WdfDriverCreate,
            driver as PDRIVER_OBJECT,
            registry_path,
            &raw mut attributes,
            &raw mut driver_config,
            &raw mut driver_handle,
        )
    };

    if !nt_success(nt_status) {
        println!("Error: WdfDriverCreate failed {nt_status:#010X}");
        context.unload();
        return nt_status;
    }

    // SAFETY: The driver object was just created with a `DriverGlobals`
    // context, which nothing has touched yet.
    unsafe {
        context_init(
            driver_get_globals(driver_handle as WDFOBJECT),
            DriverGlobals {
                context: Some(context),
            },
        );
    }

    println!("Exit: driver_entry");

    nt_status
}

/// Copies the registry path out of the I/O manager's `UNICODE_STRING`.
#[link_section = "INIT"]
fn load_driver_context(registry_path: PCUNICODE_STRING) -> Result<DriverContext, LoadError> {
    // SAFETY: The I/O manager passes a valid, initialized UNICODE_STRING that
    // outlives DriverEntry.
    let registry_path = unsafe { &*registry_path };

    let units: &[u16] = if registry_path.Buffer.is_null() {
        &[]
    } else {
        // SAFETY: `Length` is the byte length of the initialized part of
        // `Buffer`.
        unsafe {
            slice::from_raw_parts(
                registry_path.Buffer,
                registry_path.Length as usize / core::mem::size_of::<u16>(),
            )
        }
    };

    DriverContext::load(units.iter().copied())
}

/// This event callback function is called before the driver is unloaded.
///
/// Frees what `DriverEntry` allocated: the copied registry path and the URB
/// lookaside. All device objects must be gone by now.
///
/// # Argument:
///
/// * `driver` - Handle to the framework driver object
extern "C" fn vhci_evt_driver_unload(driver: WDFDRIVER) {
    println!("Enter: vhci_evt_driver_unload");

    // SAFETY: The context was initialized in DriverEntry before any other
    // callback could run, and unload is the last one.
    let globals = unsafe { &mut *driver_get_globals(driver as WDFOBJECT) };
    if let Some(context) = globals.context.take() {
        context.unload();
    }

    println!("Exit: vhci_evt_driver_unload");
}
