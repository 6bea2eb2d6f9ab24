// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Sessions opening, plugging in, cleaning up and closing against a bus that
//! is removed underneath them.

// The atomics are loom's under cfg(loom), which only work inside a model.
#![cfg(not(loom))]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    thread,
};

use vhci_core::{
    gate::{self, BusUnplug},
    ChildDevice,
    DeviceObject,
    DispatchStatus,
    DriverContext,
    PnpState,
    Port,
    Session,
    SessionId,
    SpinEvent,
};

const WORKERS: u32 = 6;
const ROUNDS: u32 = 300;

fn registry_path() -> Vec<u16> {
    r"\Registry\Machine\System\CurrentControlSet\Services\usbip_vhci"
        .encode_utf16()
        .collect()
}

#[test]
fn removal_during_session_storm_drains_cleanly() {
    let context = DriverContext::load(registry_path()).unwrap();
    let bus = context.create_bus::<SpinEvent>();
    bus.common().set_pnp_state(PnpState::Started);

    let opened = Arc::new(AtomicUsize::new(0));
    let children: Arc<Mutex<Vec<Arc<ChildDevice>>>> = Arc::default();

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let device = DeviceObject::Bus(Arc::clone(&bus));
            let opened = Arc::clone(&opened);
            let children = Arc::clone(&children);

            thread::spawn(move || {
                let bus = device.as_bus().unwrap();
                for round in 0..ROUNDS {
                    let session = Session::new(SessionId(u64::from(worker << 16 | round)));

                    match gate::open(&device) {
                        DispatchStatus::Success => {
                            opened.fetch_add(1, Ordering::SeqCst);
                        }
                        DispatchStatus::NoSuchDevice => continue,
                        DispatchStatus::InvalidDeviceRequest => unreachable!(),
                    }

                    {
                        let io = bus.acquire();
                        if !io.is_deleted() {
                            if let Ok(child) = io.plug_in(Port(worker + 1), &session) {
                                children.lock().unwrap().push(child);
                            }
                        }
                    }

                    let status = gate::cleanup(&device, &session, &BusUnplug);
                    if status == DispatchStatus::Success {
                        assert!(session.bound_child().is_none());
                    }
                    if let Some(child) = session.bound_child() {
                        // cleanup was turned away, so the binding is intact
                        assert_eq!(status, DispatchStatus::NoSuchDevice);
                        assert_eq!(child.session(), Some(session.id()));
                    }

                    let status = gate::close(&device);
                    assert_ne!(status, DispatchStatus::InvalidDeviceRequest);
                }
            })
        })
        .collect();

    while opened.load(Ordering::SeqCst) < 50 {
        thread::yield_now();
    }
    bus.acquire().remove_and_drain();
    assert!(bus.is_safe_to_destroy());

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(bus.outstanding_io(), 0);
    assert_eq!(bus.child_count(), 0);
    assert!(children.lock().unwrap().iter().all(|child| !child.is_present()));

    // Anything arriving now is turned away and leaves the counter where it was.
    let device = DeviceObject::Bus(Arc::clone(&bus));
    assert_eq!(gate::open(&device), DispatchStatus::NoSuchDevice);
    assert_eq!(bus.outstanding_io(), 0);

    drop(device);
    drop(bus);
    assert_eq!(context.device_count(), 0);
    context.unload();
}

#[test]
fn concurrent_cleanups_on_distinct_children_unplug_each_once() {
    let context = DriverContext::load(registry_path()).unwrap();
    let bus = context.create_bus::<SpinEvent>();
    bus.common().set_pnp_state(PnpState::Started);

    let sessions: Vec<_> = (1..=8_u32)
        .map(|n| {
            let session = Arc::new(Session::new(SessionId(u64::from(n))));
            bus.plug_in(Port(n), &session).unwrap();
            session
        })
        .collect();
    assert_eq!(bus.child_count(), 8);

    let cleaners: Vec<_> = sessions
        .iter()
        .map(|session| {
            let device = DeviceObject::Bus(Arc::clone(&bus));
            let session = Arc::clone(session);
            thread::spawn(move || gate::cleanup(&device, &session, &BusUnplug))
        })
        .collect();

    for cleaner in cleaners {
        assert_eq!(cleaner.join().unwrap(), DispatchStatus::Success);
    }

    assert_eq!(bus.child_count(), 0);
    assert!(sessions.iter().all(|session| session.bound_child().is_none()));
    assert_eq!(bus.outstanding_io(), 1);
    assert!(bus.is_stopped());

    bus.acquire().remove_and_drain();
    drop(bus);
    context.unload();
}
