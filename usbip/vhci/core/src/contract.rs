// Copyright (c) Microsoft Corporation.
// License: MIT OR Apache-2.0

//! Abort path for broken protocol invariants.
//!
//! A contract violation means some caller elsewhere in the driver already got
//! the reference counting wrong. It is never returned as an error: it is
//! logged and the current execution context is torn down. In the driver build
//! `panic = "abort"` plus `wdk-panic` turns this into a bugcheck.

macro_rules! contract_violation {
    ($($arg:tt)+) => {{
        log::error!("contract violation: {}", format_args!($($arg)+));
        panic!("contract violation: {}", format_args!($($arg)+))
    }};
}

/// Aborts through [`contract_violation!`] unless `$cond` holds.
macro_rules! contract_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            contract_violation!($($arg)+);
        }
    };
}
