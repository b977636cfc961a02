// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory stand-ins for the host capabilities.
//!
//! Each double keeps enough state to behave like the kernel does for the requests the
//! engine issues, records every call, and accepts injected failures.

#![allow(clippy::missing_panics_doc, clippy::must_use_candidate)]

mod file;
mod iptables;
mod netlink;

pub use file::{MemFile, MemFileOpener};
pub use iptables::{IptablesCounters, MemIptables};
pub use netlink::{MemNetLink, NetlinkCall, Op};

use crate::backend::Link;
use net::interface::{InterfaceIndex, InterfaceName};

pub const TEST_MAC1: &str = "01:23:45:67:89:a0";
pub const TEST_MAC2: &str = "01:23:45:67:89:a1";
pub const TEST_TABLE: u32 = 10;
pub const TEST_ENI_IP: &str = "10.10.10.20";
pub const TEST_ENI_SUBNET: &str = "10.10.0.0/16";
pub const TEST_MTU: u32 = 9001;

/// An administratively down link with the given identity.
///
/// # Panics
///
/// On an invalid index, name or mac.
#[allow(clippy::unwrap_used)]
pub fn link(index: u32, name: &str, mac: &str) -> Link {
    Link {
        index: InterfaceIndex::try_new(index).unwrap(),
        name: InterfaceName::try_from(name).unwrap(),
        mac: Some(mac.parse().unwrap()),
        mtu: 1500,
        up: false,
    }
}

/// `lo` at index 1, without a mac.
#[allow(clippy::unwrap_used)]
pub fn loopback() -> Link {
    Link {
        index: InterfaceIndex::try_new(1).unwrap(),
        name: InterfaceName::try_from("lo").unwrap(),
        mac: None,
        mtu: 65536,
        up: true,
    }
}
