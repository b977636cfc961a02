// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Backends operating on the running kernel.
//!
//! Netlink and iptables need `CAP_NET_ADMIN`; their unit tests stay off the kernel.

mod file;
mod iptables;
mod netlink;

pub use file::{OsFile, OsFileOpener};
pub use self::iptables::KernelIptables;
pub use netlink::KernelNetLink;
