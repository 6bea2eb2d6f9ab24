// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use log::{info, trace, warn};
use spin::Mutex;

use crate::{
    driver::Registration,
    event::{Event, SpinEvent},
    quiesce::{IoRef, OutstandingIo, Transition},
    session::{Session, SessionId},
    sync::{AtomicBool, AtomicU8, Ordering},
};

/// Plug and Play state shared by every device object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PnpState {
    NotStarted,
    Started,
    StopPending,
    Stopped,
    RemovePending,
    SurpriseRemovePending,
    /// Terminal. Nothing moves a device out of it.
    Deleted,
}

impl PnpState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Started,
            2 => Self::StopPending,
            3 => Self::Stopped,
            4 => Self::RemovePending,
            5 => Self::SurpriseRemovePending,
            _ => Self::Deleted,
        }
    }
}

/// Header common to bus and child device objects.
#[derive(Debug)]
pub struct DeviceCommon {
    pnp_state: AtomicU8,
}

impl DeviceCommon {
    fn new() -> Self {
        Self {
            pnp_state: AtomicU8::new(PnpState::NotStarted as u8),
        }
    }

    #[must_use]
    pub fn pnp_state(&self) -> PnpState {
        PnpState::from_raw(self.pnp_state.load(Ordering::SeqCst))
    }

    /// Moves to `state`. A device already `Deleted` stays `Deleted`.
    pub fn set_pnp_state(&self, state: PnpState) {
        let result = self
            .pnp_state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != PnpState::Deleted as u8).then_some(state as u8)
            });

        if let Ok(previous) = result {
            trace!("pnp state {:?} -> {state:?}", PnpState::from_raw(previous));
        }
    }
}

/// Root-hub port a child device is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(pub u32);

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Bus,
    Child,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlugError {
    /// Another present child already occupies the port.
    PortInUse(Port),
    /// The session already has a child bound to it.
    SessionBound(SessionId),
    /// The bus has been removed.
    BusRemoved,
}

impl fmt::Display for PlugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortInUse(port) => write!(f, "{port} is already in use"),
            Self::SessionBound(id) => write!(f, "session {id} already has a device plugged in"),
            Self::BusRemoved => f.write_str("bus has been removed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnplugError {
    /// No present child sits on the port.
    NoSuchPort(Port),
    /// The given child was already unplugged; the port may hold another one.
    NotPlugged(Port),
}

impl fmt::Display for UnplugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchPort(port) => write!(f, "no device plugged into {port}"),
            Self::NotPlugged(port) => write!(f, "device on {port} was already unplugged"),
        }
    }
}

/// One remote device surfaced on the virtual bus.
#[derive(Debug)]
pub struct ChildDevice {
    common: DeviceCommon,
    port: Port,
    // Cleared only while the bus's child list is locked.
    present: AtomicBool,
    // Written only while the owning session's slot is locked too.
    pub(crate) session: Mutex<Option<SessionId>>,
    _registration: Option<Registration>,
}

impl ChildDevice {
    fn new(port: Port, registration: Option<Registration>) -> Self {
        Self {
            common: DeviceCommon::new(),
            port,
            present: AtomicBool::new(true),
            session: Mutex::new(None),
            _registration: registration,
        }
    }

    #[must_use]
    pub const fn common(&self) -> &DeviceCommon {
        &self.common
    }

    #[must_use]
    pub const fn port(&self) -> Port {
        self.port
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    /// The session that opened this device, if it is still bound.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock()
    }
}

/// The virtual host controller itself.
pub struct BusDevice<E: Event = SpinEvent> {
    common: DeviceCommon,
    io: OutstandingIo<E>,
    children: Mutex<Vec<Arc<ChildDevice>>>,
    registration: Option<Registration>,
}

impl<E: Event> BusDevice<E> {
    /// Creates an idle bus: outstanding I/O at its resting value of 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registration(None)
    }

    pub(crate) fn with_registration(registration: Option<Registration>) -> Self {
        Self {
            common: DeviceCommon::new(),
            io: OutstandingIo::new(),
            children: Mutex::new(Vec::new()),
            registration,
        }
    }

    #[must_use]
    pub const fn common(&self) -> &DeviceCommon {
        &self.common
    }

    pub(crate) const fn io(&self) -> &OutstandingIo<E> {
        &self.io
    }

    /// Takes a reference on the bus's outstanding I/O.
    ///
    /// The reference is counted even if the bus turns out to be removed; check
    /// [`IoRef::is_deleted`] before doing any work.
    pub fn acquire(&self) -> IoRef<'_, E> {
        self.io.increment();
        IoRef::new(self)
    }

    /// Snapshot of the outstanding I/O counter, for diagnostics.
    #[must_use]
    pub fn outstanding_io(&self) -> i32 {
        self.io.count()
    }

    /// Whether nothing beyond the bias is in flight.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.io.stop_signal().is_set()
    }

    /// Whether the bias was released after removal and the last holder left.
    #[must_use]
    pub fn is_safe_to_destroy(&self) -> bool {
        self.io.remove_signal().is_set()
    }

    /// Performs the one-time extra decrement that removes the bias.
    ///
    /// Only legal once the bus is `Deleted`, and only once per bus.
    #[allow(clippy::must_use_candidate)]
    pub fn release_bias(&self) -> Transition {
        let state = self.common.pnp_state();
        contract_assert!(
            state == PnpState::Deleted,
            "outstanding I/O bias released while bus is {state:?}"
        );
        contract_assert!(
            self.io.surrender_bias(),
            "outstanding I/O bias released twice"
        );

        self.io.decrement(&self.common)
    }

    /// Surfaces a remote device on `port` and binds it to `session`.
    ///
    /// # Errors
    ///
    /// Fails if the bus is removed, the port is taken, or the session already
    /// owns a device.
    pub fn plug_in(&self, port: Port, session: &Session) -> Result<Arc<ChildDevice>, PlugError> {
        // Checked under the child-list lock: removal marks the bus Deleted
        // before it sweeps the list, so nothing can be added behind it.
        let mut children = self.children.lock();
        if self.common.pnp_state() == PnpState::Deleted {
            return Err(PlugError::BusRemoved);
        }
        if children.iter().any(|child| child.port == port) {
            warn!("plug_in: {port} is already in use");
            return Err(PlugError::PortInUse(port));
        }

        // Children count against the driver just like the bus that made them.
        let registration = self.registration.as_ref().map(Registration::another);
        let child = Arc::new(ChildDevice::new(port, registration));
        session.bind(&child)?;
        child.common.set_pnp_state(PnpState::Started);
        children.push(Arc::clone(&child));
        drop(children);

        info!("plugged in {port} for session {}", session.id());
        Ok(child)
    }

    /// Marks the child on `port` absent and drops it from the visible set.
    ///
    /// Never blocks beyond the short child-list lock, so it can be called
    /// while holding an [`IoRef`].
    ///
    /// # Errors
    ///
    /// [`UnplugError::NoSuchPort`] if no present child sits on `port`.
    pub fn unplug_port(&self, port: Port) -> Result<(), UnplugError> {
        let child = {
            let mut children = self.children.lock();
            let Some(index) = children.iter().position(|child| child.port == port) else {
                return Err(UnplugError::NoSuchPort(port));
            };
            let child = children.remove(index);
            child.present.store(false, Ordering::SeqCst);
            child
        };

        child.common.set_pnp_state(PnpState::SurpriseRemovePending);
        info!("unplugged {port}");
        Ok(())
    }

    /// Unplugs `child` if it is still the device on its port.
    ///
    /// Presence is checked against this exact child under the child-list
    /// lock, so a device plugged into the same port since `child` was
    /// unplugged is left alone. Never blocks beyond that lock.
    ///
    /// # Errors
    ///
    /// [`UnplugError::NotPlugged`] if `child` is no longer on the bus.
    pub fn unplug_child(&self, child: &Arc<ChildDevice>) -> Result<(), UnplugError> {
        let port = child.port;
        {
            let mut children = self.children.lock();
            let Some(index) = children.iter().position(|other| Arc::ptr_eq(other, child)) else {
                return Err(UnplugError::NotPlugged(port));
            };
            children.remove(index);
            child.present.store(false, Ordering::SeqCst);
        }

        child.common.set_pnp_state(PnpState::SurpriseRemovePending);
        info!("unplugged {port}");
        Ok(())
    }

    /// Unplugs every child still present and returns how many there were.
    pub fn unplug_all(&self) -> usize {
        let unplugged = {
            let mut children = self.children.lock();
            for child in children.iter() {
                child.present.store(false, Ordering::SeqCst);
            }
            core::mem::take(&mut *children)
        };

        for child in &unplugged {
            child.common.set_pnp_state(PnpState::SurpriseRemovePending);
        }
        unplugged.len()
    }

    #[must_use]
    pub fn child(&self, port: Port) -> Option<Arc<ChildDevice>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.port == port)
            .cloned()
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }
}

impl<E: Event> Default for BusDevice<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for BusDevice<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusDevice")
            .field("common", &self.common)
            .field("io", &self.io)
            .field("children", &self.child_count())
            .finish_non_exhaustive()
    }
}

/// A device object as the dispatch routines see it.
///
/// The variant is the discriminator: every entry point matches on it before
/// doing anything else.
pub enum DeviceObject<E: Event = SpinEvent> {
    Bus(Arc<BusDevice<E>>),
    Child(Arc<ChildDevice>),
}

impl<E: Event> DeviceObject<E> {
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        match self {
            Self::Bus(_) => DeviceKind::Bus,
            Self::Child(_) => DeviceKind::Child,
        }
    }

    #[must_use]
    pub fn common(&self) -> &DeviceCommon {
        match self {
            Self::Bus(bus) => bus.common(),
            Self::Child(child) => child.common(),
        }
    }

    #[must_use]
    pub const fn as_bus(&self) -> Option<&Arc<BusDevice<E>>> {
        match self {
            Self::Bus(bus) => Some(bus),
            Self::Child(_) => None,
        }
    }
}

impl<E: Event> Clone for DeviceObject<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Bus(bus) => Self::Bus(Arc::clone(bus)),
            Self::Child(child) => Self::Child(Arc::clone(child)),
        }
    }
}

impl<E: Event> fmt::Debug for DeviceObject<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(bus) => f.debug_tuple("Bus").field(bus).finish(),
            Self::Child(child) => f.debug_tuple("Child").field(child).finish(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn deleted_is_terminal() {
        let common = DeviceCommon::new();
        common.set_pnp_state(PnpState::Started);
        common.set_pnp_state(PnpState::RemovePending);
        assert_eq!(common.pnp_state(), PnpState::RemovePending);
        common.set_pnp_state(PnpState::Deleted);

        common.set_pnp_state(PnpState::Started);
        assert_eq!(common.pnp_state(), PnpState::Deleted);
    }

    #[test]
    fn device_object_discriminates_kind() {
        let bus = Arc::new(BusDevice::<SpinEvent>::new());
        let session = Session::new(SessionId(1));
        let child = bus.plug_in(Port(1), &session).unwrap();

        let bus_obj = DeviceObject::Bus(Arc::clone(&bus));
        let child_obj = DeviceObject::<SpinEvent>::Child(child);

        assert_eq!(bus_obj.kind(), DeviceKind::Bus);
        assert_eq!(child_obj.kind(), DeviceKind::Child);
        assert!(bus_obj.as_bus().is_some());
        assert!(child_obj.as_bus().is_none());
        assert_eq!(child_obj.common().pnp_state(), PnpState::Started);
    }

    #[test]
    fn plug_in_rejects_busy_port_and_bound_session() {
        let bus = BusDevice::<SpinEvent>::new();
        let first = Session::new(SessionId(1));
        let second = Session::new(SessionId(2));

        bus.plug_in(Port(3), &first).unwrap();
        assert_eq!(
            bus.plug_in(Port(3), &second).unwrap_err(),
            PlugError::PortInUse(Port(3))
        );
        assert_eq!(
            bus.plug_in(Port(4), &first).unwrap_err(),
            PlugError::SessionBound(SessionId(1))
        );
        assert_eq!(bus.child_count(), 1);
    }

    #[test]
    fn plug_in_binds_both_directions() {
        let bus = BusDevice::<SpinEvent>::new();
        let session = Session::new(SessionId(7));

        let child = bus.plug_in(Port(2), &session).unwrap();
        assert_eq!(child.session(), Some(SessionId(7)));
        assert!(Arc::ptr_eq(&session.bound_child().unwrap(), &child));
        assert!(child.is_present());
    }

    #[test]
    fn unplug_marks_absent_and_hides_child() {
        let bus = BusDevice::<SpinEvent>::new();
        let session = Session::new(SessionId(1));
        let child = bus.plug_in(Port(5), &session).unwrap();

        bus.unplug_port(Port(5)).unwrap();
        assert!(!child.is_present());
        assert!(bus.child(Port(5)).is_none());
        assert_eq!(
            bus.unplug_port(Port(5)).unwrap_err(),
            UnplugError::NoSuchPort(Port(5))
        );

        // the port is free again
        let other = Session::new(SessionId(2));
        bus.plug_in(Port(5), &other).unwrap();
    }

    #[test]
    fn unplug_child_leaves_a_newer_device_on_the_port_alone() {
        let bus = BusDevice::<SpinEvent>::new();
        let first = Session::new(SessionId(1));
        let second = Session::new(SessionId(2));

        let stale = bus.plug_in(Port(4), &first).unwrap();
        bus.unplug_port(Port(4)).unwrap();
        let fresh = bus.plug_in(Port(4), &second).unwrap();

        assert_eq!(
            bus.unplug_child(&stale).unwrap_err(),
            UnplugError::NotPlugged(Port(4))
        );
        assert!(fresh.is_present());
        assert!(Arc::ptr_eq(&bus.child(Port(4)).unwrap(), &fresh));
        assert_eq!(fresh.session(), Some(SessionId(2)));

        bus.unplug_child(&fresh).unwrap();
        assert!(!fresh.is_present());
        assert_eq!(bus.child_count(), 0);
    }

    #[test]
    fn unplug_all_empties_the_bus() {
        let bus = BusDevice::<SpinEvent>::new();
        let sessions: Vec<_> = (1..=3).map(|id| Session::new(SessionId(id))).collect();
        let children: Vec<_> = sessions
            .iter()
            .zip(1..)
            .map(|(session, port)| bus.plug_in(Port(port), session).unwrap())
            .collect();

        assert_eq!(bus.unplug_all(), 3);
        assert_eq!(bus.child_count(), 0);
        assert!(children.iter().all(|child| !child.is_present()));
    }

    #[test]
    fn removed_bus_refuses_new_children() {
        let bus = BusDevice::<SpinEvent>::new();
        bus.common().set_pnp_state(PnpState::Deleted);
        let session = Session::new(SessionId(1));
        assert_eq!(
            bus.plug_in(Port(1), &session).unwrap_err(),
            PlugError::BusRemoved
        );
    }
}
