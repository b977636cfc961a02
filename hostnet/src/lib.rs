// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Host network engine for ENI backed pod networking.
//!
//! The engine brings freshly attached ENIs online and keeps the host wide policy rules,
//! SNAT chains and connmark rules converged.
//! All host state is reached through the capability traits in [`backend`]; [`kernel`] holds
//! the implementations which talk to the running kernel.

#![deny(clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod connmark;
pub mod eni;
pub mod errors;
pub mod host;
pub mod kernel;
pub mod procsys;
pub mod resolver;
pub mod route;
pub mod rules;
pub mod rulespec;
pub mod snat;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{Iptables, Link, NetLink, OpenFile, WriteCloser};
pub use eni::{EniConfig, RetryPolicy, setup_eni_network};
pub use errors::NetworkError;
pub use host::{HostNetworkConfig, LinuxNetwork};
pub use route::{FwMark, PolicyRule, Route, RouteScope};
pub use rules::update_rule_list_by_src;
pub use rulespec::RuleSpec;
