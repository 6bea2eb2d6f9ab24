// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use log::{error, info};

use crate::{
    device::BusDevice,
    event::Event,
    pool::{Lookaside, UrbRequest},
    sync::{AtomicU32, AtomicUsize, Ordering},
};

/// How many released [`UrbRequest`]s the driver keeps around for reuse.
pub const URB_LOOKASIDE_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// A load-time allocation could not be satisfied.
    InsufficientResources,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientResources => f.write_str("insufficient resources"),
        }
    }
}

/// Owned copy of the driver's registry service path.
///
/// Stored as null-terminated UTF-16, the way the I/O manager handed it over.
pub struct RegistryPath {
    buffer: Vec<u16>,
}

impl RegistryPath {
    fn copy_from<I>(units: I) -> Result<Self, LoadError>
    where
        I: ExactSizeIterator<Item = u16>,
    {
        let len = units.len();
        let capacity = len.checked_add(1).ok_or(LoadError::InsufficientResources)?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| LoadError::InsufficientResources)?;
        buffer.extend(units.take(len));
        buffer.push(0);

        Ok(Self { buffer })
    }

    /// The path's UTF-16 code units, without the terminator.
    #[must_use]
    pub fn as_units(&self) -> &[u16] {
        &self.buffer[..self.buffer.len() - 1]
    }

    /// The path including its null terminator.
    #[must_use]
    pub fn as_units_with_nul(&self) -> &[u16] {
        &self.buffer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for RegistryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        char::decode_utf16(self.as_units().iter().copied())
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .try_for_each(|c| fmt::Write::write_char(f, c))
    }
}

impl fmt::Debug for RegistryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistryPath({self})")
    }
}

/// Keeps a device object counted against its driver until it is dropped.
#[derive(Debug)]
pub(crate) struct Registration(Arc<AtomicUsize>);

impl Registration {
    fn new(devices: &Arc<AtomicUsize>) -> Self {
        devices.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(devices))
    }

    /// Counts one more device object against the same driver.
    pub(crate) fn another(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State that lives from driver load to driver unload.
pub struct DriverContext {
    registry_path: RegistryPath,
    urb_pool: Lookaside<UrbRequest>,
    devices: Arc<AtomicUsize>,
    seq_num: AtomicU32,
}

impl DriverContext {
    /// Builds the driver-wide state at load time.
    ///
    /// # Errors
    ///
    /// [`LoadError::InsufficientResources`] if the registry path cannot be
    /// copied. The lookaside pool created before it is torn down again, so
    /// nothing is left half-initialized.
    pub fn load<I>(registry_path: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = u16>,
        I::IntoIter: ExactSizeIterator,
    {
        Self::load_with_depth(registry_path, URB_LOOKASIDE_DEPTH)
    }

    /// [`DriverContext::load`] with an explicit lookaside depth.
    ///
    /// # Errors
    ///
    /// See [`DriverContext::load`].
    pub fn load_with_depth<I>(registry_path: I, depth: usize) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = u16>,
        I::IntoIter: ExactSizeIterator,
    {
        let urb_pool = Lookaside::new(depth);

        let registry_path = match RegistryPath::copy_from(registry_path.into_iter()) {
            Ok(path) => path,
            Err(err) => {
                error!("load: registry path copy failed ({err}), deleting URB lookaside");
                drop(urb_pool);
                return Err(err);
            }
        };

        info!("load: registry path {registry_path}");

        Ok(Self {
            registry_path,
            urb_pool,
            devices: Arc::new(AtomicUsize::new(0)),
            seq_num: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub const fn registry_path(&self) -> &RegistryPath {
        &self.registry_path
    }

    #[must_use]
    pub const fn urb_pool(&self) -> &Lookaside<UrbRequest> {
        &self.urb_pool
    }

    /// Creates a bus device counted against this driver until it is freed.
    #[must_use]
    pub fn create_bus<E: Event>(&self) -> Arc<BusDevice<E>> {
        Arc::new(BusDevice::with_registration(Some(Registration::new(
            &self.devices,
        ))))
    }

    /// Device objects created through this context that are still alive: the
    /// buses and every child plugged into them.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.load(Ordering::SeqCst)
    }

    /// Next wire sequence number. Skips 0, which means "unassigned".
    pub fn next_seq_num(&self) -> u32 {
        loop {
            let seq_num = self.seq_num.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if seq_num != 0 {
                return seq_num;
            }
        }
    }

    /// Releases everything acquired at load.
    ///
    /// All device objects must be gone by now; the PnP side guarantees that
    /// before the driver is unloaded.
    pub fn unload(self) {
        let devices = self.device_count();
        contract_assert!(devices == 0, "unload with {devices} device object(s) still alive");

        info!("unload");
        drop(self);
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("registry_path", &self.registry_path)
            .field("urb_pool", &self.urb_pool)
            .field("devices", &self.device_count())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::{string::ToString, vec::Vec};

    use super::*;
    use crate::{
        device::Port,
        event::SpinEvent,
        session::{Session, SessionId},
    };

    const SERVICE_PATH: &str = r"\Registry\Machine\System\CurrentControlSet\Services\usbip_vhci";

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    /// Claims to hold more code units than can ever be allocated.
    struct Oversized;

    impl Iterator for Oversized {
        type Item = u16;

        fn next(&mut self) -> Option<u16> {
            Some(u16::from(b'x'))
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            (usize::MAX, Some(usize::MAX))
        }
    }

    impl ExactSizeIterator for Oversized {}

    #[test]
    fn load_copies_registry_path() {
        let units = utf16(SERVICE_PATH);
        let context = DriverContext::load(units.iter().copied()).unwrap();
        drop(units);

        assert_eq!(context.registry_path().to_string(), SERVICE_PATH);
        assert_eq!(context.registry_path().len(), SERVICE_PATH.len());
        assert_eq!(context.registry_path().as_units_with_nul().last(), Some(&0));
        assert_eq!(context.urb_pool().depth(), URB_LOOKASIDE_DEPTH);
        context.unload();
    }

    #[test]
    fn empty_registry_path_is_accepted() {
        let context = DriverContext::load(Vec::new()).unwrap();
        assert!(context.registry_path().is_empty());
        assert_eq!(context.registry_path().as_units_with_nul(), [0]);
        context.unload();
    }

    #[test]
    fn failed_path_copy_fails_load() {
        let err = DriverContext::load(Oversized).unwrap_err();
        assert_eq!(err, LoadError::InsufficientResources);
    }

    #[test]
    fn buses_are_counted_until_dropped() {
        let context = DriverContext::load_with_depth(utf16(SERVICE_PATH), 4).unwrap();

        let first = context.create_bus::<SpinEvent>();
        let second = context.create_bus::<SpinEvent>();
        assert_eq!(context.device_count(), 2);

        drop(first);
        assert_eq!(context.device_count(), 1);
        drop(second);
        assert_eq!(context.device_count(), 0);

        context.unload();
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn unload_with_live_device_aborts() {
        let context = DriverContext::load(utf16(SERVICE_PATH)).unwrap();
        let _bus = context.create_bus::<SpinEvent>();
        context.unload();
    }

    #[test]
    fn plugged_children_are_counted_too() {
        let context = DriverContext::load(utf16(SERVICE_PATH)).unwrap();
        let bus = context.create_bus::<SpinEvent>();
        let session = Session::new(SessionId(1));

        let child = bus.plug_in(Port(1), &session).unwrap();
        assert_eq!(context.device_count(), 2);

        bus.unplug_child(&child).unwrap();
        drop(child);
        // the session still holds the unplugged child
        assert_eq!(context.device_count(), 2);
        drop(session.detach());
        assert_eq!(context.device_count(), 1);

        drop(bus);
        context.unload();
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn unload_with_live_child_aborts() {
        let context = DriverContext::load(utf16(SERVICE_PATH)).unwrap();
        let bus = context.create_bus::<SpinEvent>();
        let session = Session::new(SessionId(1));
        let _child = bus.plug_in(Port(1), &session).unwrap();

        bus.unplug_all();
        drop(bus);
        context.unload();
    }

    #[test]
    fn seq_nums_are_unique_and_never_zero() {
        let context = DriverContext::load(utf16(SERVICE_PATH)).unwrap();
        context.seq_num.store(u32::MAX - 1, Ordering::SeqCst);

        assert_eq!(context.next_seq_num(), u32::MAX);
        assert_eq!(context.next_seq_num(), 1);
        assert_eq!(context.next_seq_num(), 2);
    }

    #[test]
    fn pool_serves_urbs_for_the_pipeline() {
        let context = DriverContext::load_with_depth(utf16(SERVICE_PATH), 2).unwrap();

        let mut urb = context.urb_pool().allocate();
        urb.seq_num = context.next_seq_num();
        assert_eq!(urb.seq_num, 1);
        assert_eq!(context.urb_pool().outstanding(), 1);
        drop(urb);

        assert_eq!(context.urb_pool().outstanding(), 0);
        context.unload();
    }
}
