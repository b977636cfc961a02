// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Capabilities the engine needs from the host.
//!
//! The engine never touches the kernel directly.
//! Each trait here has a kernel backed implementation in [`crate::kernel`] and an in-memory
//! double in `crate::testing`.

use crate::route::{PolicyRule, Route};
use crate::rulespec::RuleSpec;
use ipnet::Ipv4Net;
use net::eth::mac::Mac;
use net::interface::{InterfaceIndex, InterfaceName, Mtu};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// A network device as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: InterfaceIndex,
    pub name: InterfaceName,
    /// Devices without a link layer address (loopback, tunnels) have no mac.
    pub mac: Option<Mac>,
    /// Raw MTU; loopback devices routinely report values above [`Mtu::MAX`].
    pub mtu: u32,
    /// Administrative state (`IFF_UP`).
    pub up: bool,
}

impl Display for Link {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (index {})", self.name, self.index)
    }
}

/// Failure classes of netlink requests which the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetlinkError {
    #[error("no such object")]
    NotFound,
    #[error("object already exists")]
    Exists,
    #[error("network is unreachable")]
    Unreachable,
    #[error("{0}")]
    Other(String),
}

/// Link, address, route and rule operations.
pub trait NetLink {
    /// List every network device.
    ///
    /// # Errors
    ///
    /// Returns a [`NetlinkError`] if the kernel refuses the dump.
    fn link_list(&self) -> Result<Vec<Link>, NetlinkError>;

    /// Fetch one network device.
    ///
    /// # Errors
    ///
    /// [`NetlinkError::NotFound`] if no device has that index.
    fn link_by_index(&self, index: InterfaceIndex) -> Result<Link, NetlinkError>;

    /// # Errors
    ///
    /// Returns a [`NetlinkError`] if the kernel rejects the new MTU.
    fn link_set_mtu(&self, link: &Link, mtu: Mtu) -> Result<(), NetlinkError>;

    /// Set the device administratively up.
    ///
    /// # Errors
    ///
    /// Returns a [`NetlinkError`] if the kernel rejects the request.
    fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError>;

    /// IPv4 addresses assigned to the device.
    ///
    /// # Errors
    ///
    /// Returns a [`NetlinkError`] if the kernel refuses the dump.
    fn addr_list(&self, link: &Link) -> Result<Vec<Ipv4Net>, NetlinkError>;

    /// # Errors
    ///
    /// [`NetlinkError::Exists`] if the address is already assigned.
    fn addr_add(&self, link: &Link, address: Ipv4Net) -> Result<(), NetlinkError>;

    /// # Errors
    ///
    /// [`NetlinkError::Exists`] if a route for the destination is already in the table,
    /// [`NetlinkError::Unreachable`] if the gateway is not (yet) reachable.
    fn route_add(&self, route: &Route) -> Result<(), NetlinkError>;

    /// Delete the route matching every field set in `route`.
    ///
    /// # Errors
    ///
    /// [`NetlinkError::NotFound`] if nothing matches.
    fn route_del(&self, route: &Route) -> Result<(), NetlinkError>;

    /// A blank rule to fill in before [`NetLink::rule_add`].
    fn new_rule(&self) -> PolicyRule {
        PolicyRule::default()
    }

    /// # Errors
    ///
    /// Returns a [`NetlinkError`] if the kernel rejects the rule.
    fn rule_add(&self, rule: &PolicyRule) -> Result<(), NetlinkError>;

    /// Delete the first rule matching every field set in `rule`.
    ///
    /// # Errors
    ///
    /// [`NetlinkError::NotFound`] if nothing matches.
    fn rule_del(&self, rule: &PolicyRule) -> Result<(), NetlinkError>;

    /// Every IPv4 policy rule.
    ///
    /// # Errors
    ///
    /// Returns a [`NetlinkError`] if the kernel refuses the dump.
    fn rule_list(&self) -> Result<Vec<PolicyRule>, NetlinkError>;
}

/// A failed iptables operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("iptables {operation} on {table}/{chain} failed: {reason}")]
pub struct IptablesError {
    pub operation: &'static str,
    pub table: String,
    pub chain: String,
    pub reason: String,
}

impl IptablesError {
    pub fn new(
        operation: &'static str,
        table: &str,
        chain: &str,
        reason: impl Display,
    ) -> IptablesError {
        IptablesError {
            operation,
            table: table.to_string(),
            chain: chain.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Table and chain manipulation in the style of the `iptables` command.
pub trait Iptables {
    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the check itself fails (e.g. missing chain).
    fn exists(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<bool, IptablesError>;

    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the rule is rejected.
    fn append(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), IptablesError>;

    /// Delete the first rule equal to `rule`.
    ///
    /// # Errors
    ///
    /// Returns an [`IptablesError`] if no such rule exists.
    fn delete(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), IptablesError>;

    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the chain already exists.
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// Remove every rule of the chain.
    ///
    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the chain does not exist.
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the chain is missing, not empty, or still referenced.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// Names of every chain in the table, built in chains included.
    ///
    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the table cannot be read.
    fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError>;

    /// The chain in `iptables -S` form: a `-N`/`-P` line followed by one `-A` line per rule.
    ///
    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the chain cannot be read.
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError>;

    /// Whether the SNAT target understands `--random-fully`.
    fn has_random_fully(&self) -> bool;
}

/// Failure of a scoped file operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("open failed: {0}")]
    Open(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("close failed: {0}")]
    Close(String),
    #[error("file already closed")]
    Closed,
}

/// An open, writable file which must be closed explicitly.
pub trait WriteCloser {
    /// # Errors
    ///
    /// [`FileError::Closed`] after [`WriteCloser::close`], [`FileError::Write`] otherwise.
    fn write_str(&mut self, data: &str) -> Result<(), FileError>;

    /// # Errors
    ///
    /// [`FileError::Closed`] on a second close, [`FileError::Close`] otherwise.
    fn close(&mut self) -> Result<(), FileError>;
}

/// Opens files for writing.
pub trait OpenFile {
    type File: WriteCloser;

    /// # Errors
    ///
    /// [`FileError::Open`] if the file cannot be opened.
    fn open(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<Self::File, FileError>;
}
