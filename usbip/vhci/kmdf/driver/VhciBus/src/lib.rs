// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! # Abstract
//!
//!    Bus driver for the usbip virtual host controller (VHCI).
//!
//!    The bus device object exposes remote USB devices to the system as if
//!    they were plugged in locally. User mode opens a handle on the bus to
//!    plug a remote device in; when that handle is cleaned up, the device it
//!    plugged in is unplugged again.
//!
//!    Handles can be opened, cleaned up and closed on any thread while PnP is
//!    stopping or removing the bus. Every one of those entry points goes
//!    through the admission gate in `usbip-vhci-core`, which keeps a
//!    1-biased outstanding-I/O count on the bus. PnP waits on the count's
//!    *stopped* event before a stop and on its *safe-to-destroy* event before
//!    the bus context is freed.

#![no_std]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![allow(clippy::missing_safety_doc)]

mod device;
mod driver;
mod event;
mod file;
mod logger;
mod wdf_object_context;

#[cfg(not(test))]
extern crate wdk_panic;

extern crate alloc;

use vhci_core::{DeviceObject, DriverContext, Session};
#[cfg(not(test))]
use wdk_alloc::WdkAllocator;
use wdk_sys::{
    call_unsafe_wdf_function_binding,
    GUID,
    ULONG,
    WDFOBJECT,
    WDF_DRIVER_CONFIG,
    WDF_FILEOBJECT_CONFIG,
    WDF_OBJECT_ATTRIBUTES,
    WDF_OBJECT_CONTEXT_TYPE_INFO,
    WDF_PNPPOWER_EVENT_CALLBACKS,
};

use crate::{event::KernelEvent, wdf_object_context::wdf_declare_context_type_with_name};

#[cfg(not(test))]
#[global_allocator]
static GLOBAL_ALLOCATOR: WdkAllocator = WdkAllocator;

// {D35F7840-6A0C-11D2-B841-00C04FAD5171}
const GUID_DEVINTERFACE_VHCI_USBIP: GUID = GUID {
    Data1: 0xD35F_7840u32,
    Data2: 0x6A0Cu16,
    Data3: 0x11D2u16,
    Data4: [
        0xB8u8, 0x41u8, 0x00u8, 0xC0u8, 0x4Fu8, 0xADu8, 0x51u8, 0x71u8,
    ],
};

// ====== CONTEXT SETUP ========//

/// Driver-wide state, alive from `DriverEntry` to `EvtDriverUnload`.
///
/// Taken out (and the slot left empty) at unload, so nothing can read it once
/// teardown has begun.
pub struct DriverGlobals {
    context: Option<DriverContext>,
}
wdf_declare_context_type_with_name!(DriverGlobals, driver_get_globals);

/// The device extension: which kind of device object this is, and its state.
pub struct DeviceContext {
    device: DeviceObject<KernelEvent>,
}
wdf_declare_context_type_with_name!(DeviceContext, device_get_context);

/// One open handle on the bus.
pub struct FileContext {
    session: Session,
}
wdf_declare_context_type_with_name!(FileContext, file_get_context);

// None of the below SIZE constants should be needed after an equivalent `WDF_STRUCTURE_SIZE` macro is added to `wdk-sys`: https://github.com/microsoft/windows-drivers-rs/issues/242

macro_rules! wdf_structure_size {
    ($name:ident, $structure:ty) => {
        #[allow(
            clippy::cast_possible_truncation,
            reason = "size is known to fit in ULONG due to below const assert"
        )]
        const $name: ULONG = {
            const S: usize = core::mem::size_of::<$structure>();
            const {
                assert!(
                    S <= ULONG::MAX as usize,
                    concat!("size_of::<", stringify!($structure), ">() should fit in ULONG")
                );
            };
            S as ULONG
        };
    };
}

wdf_structure_size!(WDF_DRIVER_CONFIG_SIZE, WDF_DRIVER_CONFIG);
wdf_structure_size!(WDF_FILEOBJECT_CONFIG_SIZE, WDF_FILEOBJECT_CONFIG);
wdf_structure_size!(WDF_OBJECT_ATTRIBUTES_SIZE, WDF_OBJECT_ATTRIBUTES);
wdf_structure_size!(WDF_OBJECT_CONTEXT_TYPE_INFO_SIZE, WDF_OBJECT_CONTEXT_TYPE_INFO);
wdf_structure_size!(WDF_PNPPOWER_EVENT_CALLBACKS_SIZE, WDF_PNPPOWER_EVENT_CALLBACKS);
