// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Policy rules steering pod traffic into per-ENI tables.

use crate::backend::{NetLink, NetlinkError};
use crate::errors::NetworkError;
use crate::route::{FROM_POD_RULE_PRIORITY, PolicyRule};
use ipnet::Ipv4Net;
use tracing::{debug, info};

/// Replace the rules of `source` by a fresh set bound to the same table.
///
/// The table is taken from the existing rules of `source`; without any there is nothing to
/// replace and nothing is done. With `requires_snat` one rule per destination is added, in
/// order, so only traffic towards those destinations uses the ENI table; otherwise a
/// single rule sends all traffic of `source` there.
///
/// # Errors
///
/// [`NetworkError::RuleUpdate`] if a rule cannot be deleted (other than being gone
/// already) or added.
#[tracing::instrument(level = "info", skip(netlink, existing))]
pub fn update_rule_list_by_src<N: NetLink + ?Sized>(
    netlink: &N,
    existing: &[PolicyRule],
    source: Ipv4Net,
    destinations: &[Ipv4Net],
    requires_snat: bool,
) -> Result<(), NetworkError> {
    let owned: Vec<&PolicyRule> = existing
        .iter()
        .filter(|rule| rule.source == Some(source))
        .collect();
    let Some(first) = owned.first() else {
        debug!("no rule for {source}, nothing to update");
        return Ok(());
    };
    let table = first.table;

    for rule in &owned {
        match netlink.rule_del(rule) {
            Ok(()) => debug!("deleted rule {rule}"),
            Err(NetlinkError::NotFound) => debug!("rule {rule} already gone"),
            Err(source) => {
                return Err(NetworkError::RuleUpdate {
                    action: "delete",
                    rule: rule.to_string(),
                    source,
                });
            }
        }
    }

    let template = PolicyRule {
        source: Some(source),
        table,
        priority: Some(FROM_POD_RULE_PRIORITY),
        ..netlink.new_rule()
    };
    let replacements: Vec<PolicyRule> = if requires_snat {
        destinations
            .iter()
            .map(|destination| PolicyRule {
                destination: Some(*destination),
                ..template.clone()
            })
            .collect()
    } else {
        vec![template]
    };
    for rule in &replacements {
        netlink
            .rule_add(rule)
            .map_err(|source| NetworkError::RuleUpdate {
                action: "add",
                rule: rule.to_string(),
                source,
            })?;
        info!("added rule {rule}");
    }
    Ok(())
}
