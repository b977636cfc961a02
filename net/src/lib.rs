// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Validated value types shared by the host network engine: hardware addresses, IPv4
//! address arithmetic, and the identifiers the kernel uses for network devices.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::should_panic_without_expect)] // we panic in contract checks with simple unwrap()

pub mod eth;
pub mod interface;
pub mod ipv4;
