// Copyright (c) Microsoft Corporation
// License: MIT OR Apache-2.0

//! Opens and closes handles on the usbip VHCI bus.
//!
//! A single open/close exercises the driver's create, cleanup and close
//! paths. In stress mode several threads do the same in a loop, which is
//! meant to be run while the bus is disabled and re-enabled from Device
//! Manager: every open then either succeeds or fails cleanly with
//! `ERROR_FILE_NOT_FOUND` or `ERROR_NO_SUCH_DEVICE`.
#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::cargo)]
#![deny(clippy::multiple_unsafe_ops_per_block)]
#![deny(clippy::undocumented_unsafe_blocks)]
#![deny(clippy::unnecessary_safety_doc)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_html_tags)]
#![deny(rustdoc::invalid_rust_codeblocks)]
#![deny(rustdoc::bare_urls)]
#![deny(rustdoc::unescaped_backticks)]
#![deny(rustdoc::redundant_explicit_links)]

use std::{
    env,
    error::Error,
    ffi::OsString,
    os::windows::prelude::*,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use once_cell::sync::OnceCell;
use uuid::{uuid, Uuid};
use windows_sys::Win32::{
    Devices::DeviceAndDriverInstallation,
    Foundation::{CloseHandle, GetLastError, FALSE, HANDLE, INVALID_HANDLE_VALUE},
    Storage::FileSystem::{
        CreateFileW,
        FILE_GENERIC_READ,
        FILE_GENERIC_WRITE,
        FILE_SHARE_READ,
        FILE_SHARE_WRITE,
        OPEN_EXISTING,
    },
};

/// Null-terminated UTF-16 path of the first bus interface found.
static DEVICE_PATH: OnceCell<Vec<u16>> = OnceCell::new();
static GUID_DEVINTERFACE_VHCI_USBIP: Uuid = uuid!("D35F7840-6A0C-11D2-B841-00C04FAD5171");
static FAILED_OPENS: AtomicUsize = AtomicUsize::new(0);

const USAGE: &str = r"
Usage:
    vhciapp.exe                           --- Open and close the bus once
    vhciapp.exe -Stress <threads> <loops> --- Open and close the bus <loops> times on each of <threads> threads
";

fn main() -> Result<(), Box<dyn Error>> {
    let argument_vector: Vec<String> = env::args().collect();

    let stress = match argument_vector.as_slice() {
        [_] => None,
        [_, flag, threads, loops] if flag == "-Stress" => {
            Some((threads.parse::<usize>()?, loops.parse::<usize>()?))
        }
        _ => {
            eprintln!("{USAGE}");
            return Err("Invalid Args".into());
        }
    };

    let device_path = get_device_path(&GUID_DEVINTERFACE_VHCI_USBIP)?;
    println!(
        "DevicePath: {}",
        String::from_utf16_lossy(device_path.strip_suffix(&[0]).unwrap_or(device_path))
    );

    let Some((thread_count, loops)) = stress else {
        let h_device = open_device()?;
        println!("Opened device successfully");
        close_device(h_device);
        println!("Closed device successfully");
        return Ok(());
    };

    println!("Starting stress: {thread_count} threads, {loops} loops each");

    let workers: Vec<_> = (0..thread_count)
        .map(|worker| thread::spawn(move || stress_worker(worker, loops)))
        .collect();

    let mut opened = 0;
    for worker in workers {
        opened += worker.join().map_err(|_| "stress worker panicked")?;
    }

    let failed = FAILED_OPENS.load(Ordering::Relaxed);
    println!("Stress done: {opened} opens succeeded, {failed} failed");

    Ok(())
}

/// Opens and closes the bus `loops` times. Returns how many opens succeeded.
fn stress_worker(worker: usize, loops: usize) -> usize {
    let mut opened = 0;
    for iteration in 0..loops {
        match open_device() {
            Ok(h_device) => {
                opened += 1;
                close_device(h_device);
            }
            Err(e) => {
                FAILED_OPENS.fetch_add(1, Ordering::Relaxed);
                eprintln!("worker {worker}, loop {iteration}: {e}");
            }
        }
    }
    opened
}

fn open_device() -> Result<HANDLE, Box<dyn Error>> {
    let path = DEVICE_PATH.get().ok_or("device path not resolved")?;

    // SAFETY:
    // Call Win32 API FFI CreateFileW to open the bus. `path` is null-terminated.
    let h_device = unsafe {
        CreateFileW(
            path.as_ptr(),
            FILE_GENERIC_READ | FILE_GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        )
    };

    if h_device == INVALID_HANDLE_VALUE {
        // SAFETY:
        // Call Win32 API FFI GetLastError() to find out why CreateFileW failed
        let error = unsafe { GetLastError() };
        return Err(format!("Failed to open device. Error {error}").into());
    }

    Ok(h_device)
}

/// Closing the only handle sends both cleanup and close to the driver.
fn close_device(h_device: HANDLE) {
    // SAFETY:
    // Call Win32 API FFI CloseHandle to close a handle returned by CreateFileW
    let closed = unsafe { CloseHandle(h_device) };
    if closed == FALSE {
        // SAFETY:
        // Call Win32 API FFI GetLastError() to find out why CloseHandle failed
        let error = unsafe { GetLastError() };
        eprintln!("Failed to close device. Error {error}");
    }
}

fn get_device_path(interface_guid: &Uuid) -> Result<&'static [u16], Box<dyn Error>> {
    let mut guid = windows_sys::core::GUID {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0, 0, 0, 0, 0, 0, 0, 0],
    };
    let guid_data4: &[u8; 8];
    let mut device_interface_list_length: u32 = 0;

    (guid.data1, guid.data2, guid.data3, guid_data4) = interface_guid.as_fields();
    guid.data4 = *guid_data4;

    // SAFETY:
    // Call Win32 API FFI CM_Get_Device_Interface_List_SizeW to determine size of
    // space needed for a subsequent request
    let mut config_ret = unsafe {
        DeviceAndDriverInstallation::CM_Get_Device_Interface_List_SizeW(
            &mut device_interface_list_length,
            &guid,
            std::ptr::null(),
            DeviceAndDriverInstallation::CM_GET_DEVICE_INTERFACE_LIST_PRESENT,
        )
    };

    if config_ret != DeviceAndDriverInstallation::CR_SUCCESS {
        return Err(
            format!("Error 0x{config_ret:08X} retrieving device interface list size.",).into(),
        );
    }

    if device_interface_list_length <= 1 {
        return Err("Error: No active device interfaces found.  Is the VHCI driver loaded?".into());
    }

    let mut buffer: Vec<u16> = vec![0; usize::try_from(device_interface_list_length)?];

    // SAFETY:
    // Call Win32 API FFI CM_Get_Device_Interface_ListW to get the list of Device
    // Interfaces that match the Interface GUID for the bus. `buffer` holds
    // `device_interface_list_length` characters.
    config_ret = unsafe {
        DeviceAndDriverInstallation::CM_Get_Device_Interface_ListW(
            &guid,
            std::ptr::null(),
            buffer.as_mut_ptr(),
            device_interface_list_length,
            DeviceAndDriverInstallation::CM_GET_DEVICE_INTERFACE_LIST_PRESENT,
        )
    };

    if config_ret != DeviceAndDriverInstallation::CR_SUCCESS {
        return Err(format!("Error 0x{config_ret:08X} retrieving device interface list.").into());
    }

    // The list is a sequence of null-terminated paths; keep the first one.
    let first_len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    let first = OsString::from_wide(&buffer[..first_len]);
    if first.is_empty() {
        return Err("Error: Device interface list is empty.".into());
    }

    let mut path: Vec<u16> = first.encode_wide().collect();
    path.push(0);

    Ok(DEVICE_PATH.get_or_init(|| path).as_slice())
}
