// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPv4 address arithmetic

mod addr;

pub use addr::{Ipv4Overflow, first_usable, next_address};
