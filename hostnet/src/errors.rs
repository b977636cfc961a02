// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{FileError, IptablesError, NetlinkError};
use net::eth::mac::Mac;
use net::interface::IllegalInterfaceName;
use net::ipv4::Ipv4Overflow;
use std::path::PathBuf;

/// Errors returned by the engine.
///
/// Each variant stops the operation at the first fatal step; whatever was applied up to
/// that point is converged by the next invocation.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The device never showed up in the link table.
    #[error("no interface with mac {mac} found after {attempts} attempt(s)")]
    InterfaceNotFound {
        mac: Mac,
        attempts: u32,
        /// The last listing error, if every listing attempt failed.
        #[source]
        source: Option<NetlinkError>,
    },
    /// MTU, admin state or address assignment failed.
    #[error("failed to {action} on {interface}")]
    DeviceConfig {
        interface: String,
        action: &'static str,
        #[source]
        source: NetlinkError,
    },
    /// A route could not be installed after clearing its destination.
    #[error("failed to install route {route}")]
    RouteConvergence {
        route: String,
        #[source]
        source: NetlinkError,
    },
    #[error("failed to {action} policy rule '{rule}'")]
    RuleUpdate {
        action: &'static str,
        rule: String,
        #[source]
        source: NetlinkError,
    },
    /// Chain or rule manipulation failed.
    #[error(transparent)]
    Firewall(#[from] IptablesError),
    #[error("failed to configure {}", path.display())]
    ProcSys {
        path: PathBuf,
        #[source]
        source: FileError,
    },
    /// A scoped file was written or closed after it had been released.
    #[error("{} used after it was closed", path.display())]
    ResourceLifecycle { path: PathBuf },
    #[error(transparent)]
    AddressOverflow(#[from] Ipv4Overflow),
    #[error(transparent)]
    InterfaceName(#[from] IllegalInterfaceName),
}
