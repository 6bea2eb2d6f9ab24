// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Typed context memory on framework objects.
//!
//! The framework allocates context memory zero-filled and knows nothing about
//! Rust ownership. Every context declared here holds Rust values with drop
//! glue, so it is written once with [`context_init`] right after the object
//! is created and dropped once with [`context_drop`] from the object's
//! `EvtDestroyCallback`.

use wdk_sys::{
    PCWDF_OBJECT_CONTEXT_TYPE_INFO,
    PFN_WDF_OBJECT_CONTEXT_CLEANUP,
    PFN_WDF_OBJECT_CONTEXT_DESTROY,
    WDFOBJECT,
    WDF_OBJECT_ATTRIBUTES,
    WDF_OBJECT_CONTEXT_TYPE_INFO,
    _WDF_EXECUTION_LEVEL,
    _WDF_SYNCHRONIZATION_SCOPE,
};

use crate::WDF_OBJECT_ATTRIBUTES_SIZE;

#[repr(transparent)]
pub struct WDFObjectContextTypeInfo(WDF_OBJECT_CONTEXT_TYPE_INFO);
// SAFETY: The type info is immutable after construction and only ever read by
// the framework.
unsafe impl Sync for WDFObjectContextTypeInfo {}

impl WDFObjectContextTypeInfo {
    pub const fn new(inner: WDF_OBJECT_CONTEXT_TYPE_INFO) -> Self {
        Self(inner)
    }

    pub const fn get_unique_type(&self) -> PCWDF_OBJECT_CONTEXT_TYPE_INFO {
        self.0.UniqueType
    }
}

/// Attributes for creating an object that carries the context described by
/// `type_info`.
pub fn context_attributes(
    type_info: PCWDF_OBJECT_CONTEXT_TYPE_INFO,
    cleanup: PFN_WDF_OBJECT_CONTEXT_CLEANUP,
    destroy: PFN_WDF_OBJECT_CONTEXT_DESTROY,
) -> WDF_OBJECT_ATTRIBUTES {
    WDF_OBJECT_ATTRIBUTES {
        Size: WDF_OBJECT_ATTRIBUTES_SIZE,
        ExecutionLevel: _WDF_EXECUTION_LEVEL::WdfExecutionLevelInheritFromParent,
        SynchronizationScope: _WDF_SYNCHRONIZATION_SCOPE::WdfSynchronizationScopeInheritFromParent,
        ContextTypeInfo: type_info,
        EvtCleanupCallback: cleanup,
        EvtDestroyCallback: destroy,
        ..WDF_OBJECT_ATTRIBUTES::default()
    }
}

/// Moves `value` into framework-allocated context memory.
///
/// # Safety
///
/// `context` must point at the zero-filled context memory of a live object,
/// and must not have been initialized before.
pub unsafe fn context_init<T>(context: *mut T, value: T) {
    // SAFETY: Upheld by the caller: the memory is valid for writes and holds
    // no value that would need dropping.
    unsafe { context.write(value) };
}

/// Drops a context written by [`context_init`].
///
/// # Safety
///
/// `context` must have been initialized with [`context_init`] and must not be
/// used again afterwards.
pub unsafe fn context_drop<T>(context: *mut T) {
    // SAFETY: Upheld by the caller: the value is initialized and this is the
    // last access to it.
    unsafe { core::ptr::drop_in_place(context) };
}

macro_rules! wdf_get_context_type_info {
    ($context_type:ident) => {
        paste::paste! {
            [<WDF_ $context_type:snake:upper _TYPE_INFO>].get_unique_type()
        }
    };
}

pub(crate) use wdf_get_context_type_info;

macro_rules! wdf_declare_context_type_with_name {
    ($context_type:ident , $casting_function:ident) => {
        paste::paste! {
            #[link_section = ".data"]
            pub static [<WDF_ $context_type:snake:upper _TYPE_INFO>]: crate::wdf_object_context::WDFObjectContextTypeInfo = crate::wdf_object_context::WDFObjectContextTypeInfo::new(WDF_OBJECT_CONTEXT_TYPE_INFO {
                Size: crate::WDF_OBJECT_CONTEXT_TYPE_INFO_SIZE,
                ContextName: concat!(stringify!($context_type),'\0').as_bytes().as_ptr().cast(),
                ContextSize: core::mem::size_of::<$context_type>(),
                UniqueType: core::ptr::addr_of!([<WDF_ $context_type:snake:upper _TYPE_INFO>]) as *const WDF_OBJECT_CONTEXT_TYPE_INFO,
                EvtDriverGetUniqueContextType: None,
            });

            /// Raw pointer to this object's context memory.
            pub unsafe fn $casting_function(handle: WDFOBJECT) -> *mut $context_type {
                unsafe {
                    call_unsafe_wdf_function_binding!(
                        WdfObjectGetTypedContextWorker,
                        handle,
                        crate::wdf_object_context::wdf_get_context_type_info!($context_type),
                    ).cast()
                }
            }
        }
    };
}

pub(crate) use wdf_declare_context_type_with_name;

/// `EvtDestroyCallback` that drops a context of type `T`.
pub fn destroy_callback<T>(
    object: WDFOBJECT,
    get_context: unsafe fn(WDFOBJECT) -> *mut T,
) {
    // SAFETY: Only installed on objects whose context was written with
    // `context_init` during creation; the framework calls destroy once.
    unsafe { context_drop(get_context(object)) };
}
