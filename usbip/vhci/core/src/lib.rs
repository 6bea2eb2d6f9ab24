// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! # Abstract
//!
//!    Lifecycle core of the usbip virtual host controller (VHCI) bus driver.
//!
//!    The bus device object can be stopped or removed at any instant while
//!    other threads are opening, cleaning up and closing sessions against it.
//!    This crate owns the pieces that keep that safe:
//!
//!    * [`BusDevice`] carries a 1-biased outstanding-I/O counter paired with
//!      a *stopped* and a *safe-to-destroy* signal. Work against the bus is
//!      admitted through [`BusDevice::acquire`], which hands out an
//!      [`IoRef`] guard that releases on every exit path.
//!    * [`DeviceObject`] is the bus/child discriminated device model sharing a
//!      common PnP header.
//!    * [`gate`] holds the create/cleanup/close entry points that reject the
//!      wrong device kind, reject removed buses, and unplug a session's child
//!      at cleanup.
//!    * [`DriverContext`] is the load-to-unload state: the copied registry
//!      path and the request-tracking lookaside pool.
//!
//!    Nothing here touches the kernel directly. The KMDF driver crate binds
//!    the [`Event`] trait to kernel events and forwards the framework's
//!    file-object callbacks into [`gate`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

extern crate alloc;

#[macro_use]
mod contract;

mod device;
mod driver;
mod event;
pub mod gate;
mod pool;
mod quiesce;
mod session;
mod sync;


pub use device::{
    BusDevice,
    ChildDevice,
    DeviceCommon,
    DeviceKind,
    DeviceObject,
    PlugError,
    PnpState,
    Port,
    UnplugError,
};
pub use driver::{DriverContext, LoadError, RegistryPath, URB_LOOKASIDE_DEPTH};
pub use event::{Event, SpinEvent};
pub use gate::DispatchStatus;
pub use pool::{Lookaside, PoolEntry, UrbRequest};
pub use quiesce::{IoRef, Transition};
pub use session::{Session, SessionId};
