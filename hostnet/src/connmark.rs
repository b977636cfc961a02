// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Connection marks for traffic entering through the primary ENI.
//!
//! Connections arriving on the primary interface for a local address get the primary ENI
//! mark on their conntrack entry; packets from pods have the mark restored, which the main
//! ENI policy rule then routes back out of the primary interface.

use crate::backend::Iptables;
use crate::errors::NetworkError;
use crate::rulespec::RuleSpec;
use net::interface::InterfaceName;
use tracing::{debug, info};

pub const CONNMARK_TABLE: &str = "mangle";
pub const CONNMARK_CHAIN: &str = "PREROUTING";
const CONNMARK_COMMENT: &str = "AWS, primary ENI";

/// The mangle/PREROUTING rules for the primary interface and `mark`.
#[must_use]
pub fn connmark_rules(primary: &InterfaceName, mark: u32) -> [RuleSpec; 2] {
    let set_mark = format!("{mark:#x}/{mark:#x}");
    let mask = format!("{mark:#x}");
    [
        RuleSpec::from([
            "-m",
            "comment",
            "--comment",
            CONNMARK_COMMENT,
            "-i",
            primary.as_ref(),
            "-m",
            "addrtype",
            "--dst-type",
            "LOCAL",
            "--limit-iface-in",
            "-j",
            "CONNMARK",
            "--set-mark",
            set_mark.as_str(),
        ]),
        RuleSpec::from([
            "-m",
            "comment",
            "--comment",
            CONNMARK_COMMENT,
            "-i",
            "eni+",
            "-j",
            "CONNMARK",
            "--restore-mark",
            "--mask",
            mask.as_str(),
        ]),
    ]
}

/// Install (`enabled`) or remove the connmark rules.
///
/// # Errors
///
/// [`NetworkError::Firewall`] if a rule cannot be checked, added or removed.
#[tracing::instrument(level = "debug", skip(iptables))]
pub fn ensure_connmark_rules<I: Iptables + ?Sized>(
    iptables: &I,
    primary: &InterfaceName,
    mark: u32,
    enabled: bool,
) -> Result<(), NetworkError> {
    for rule in connmark_rules(primary, mark) {
        let present = iptables.exists(CONNMARK_TABLE, CONNMARK_CHAIN, &rule)?;
        match (enabled, present) {
            (true, false) => {
                iptables.append(CONNMARK_TABLE, CONNMARK_CHAIN, &rule)?;
                info!("added {CONNMARK_TABLE}/{CONNMARK_CHAIN} rule: {rule}");
            }
            (false, true) => {
                iptables.delete(CONNMARK_TABLE, CONNMARK_CHAIN, &rule)?;
                info!("removed {CONNMARK_TABLE}/{CONNMARK_CHAIN} rule: {rule}");
            }
            _ => debug!("{CONNMARK_TABLE}/{CONNMARK_CHAIN} rule already converged: {rule}"),
        }
    }
    Ok(())
}
