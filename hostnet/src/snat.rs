// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! SNAT for traffic leaving the VPC.
//!
//! The nat table holds an ordered sequence of chains `AWS-SNAT-CHAIN-0 .. AWS-SNAT-CHAIN-k`.
//! Chain `i < k` holds a single rule jumping to chain `i + 1` unless the destination is in
//! the `i`-th excluded CIDR, so traffic only reaches the SNAT rule in the terminal chain `k`
//! if its destination is in none of them.
//! POSTROUTING jumps to chain 0.

use crate::backend::Iptables;
use crate::errors::NetworkError;
use crate::rulespec::RuleSpec;
use args::RandomizeSnat;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

pub const SNAT_TABLE: &str = "nat";
pub const SNAT_DISPATCH_CHAIN: &str = "POSTROUTING";
pub const SNAT_CHAIN_PREFIX: &str = "AWS-SNAT-CHAIN-";

const CHAIN_COMMENT: &str = "AWS SNAT CHAIN";
const EXCLUSION_COMMENT: &str = "AWS SNAT CHAIN EXCLUSION";
/// Misspelling carried by rules of older releases.
const LEGACY_CHAIN_COMMENT: &str = "AWS SNAT CHAN";
const SNAT_COMMENT: &str = "AWS, SNAT";

/// Name of the `index`-th chain.
#[must_use]
pub fn chain_name(index: usize) -> String {
    format!("{SNAT_CHAIN_PREFIX}{index}")
}

/// Index of a managed chain, `None` for any other chain.
fn chain_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(SNAT_CHAIN_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn dispatch_rule(comment: &str) -> RuleSpec {
    let first = chain_name(0);
    RuleSpec::from(["-m", "comment", "--comment", comment, "-j", first.as_str()])
}

fn exclusion_rule(destination: Ipv4Net, comment: &str, next: &str) -> RuleSpec {
    let destination = destination.to_string();
    RuleSpec::from([
        "!",
        "-d",
        destination.as_str(),
        "-m",
        "comment",
        "--comment",
        comment,
        "-j",
        next,
    ])
}

fn snat_rule(source: Ipv4Addr, randomization: RandomizeSnat, random_fully: bool) -> RuleSpec {
    let source = source.to_string();
    let mut args: Vec<String> = [
        "-m",
        "comment",
        "--comment",
        SNAT_COMMENT,
        "-m",
        "addrtype",
        "!",
        "--dst-type",
        "LOCAL",
        "-j",
        "SNAT",
        "--to-source",
        source.as_str(),
    ]
    .into_iter()
    .map(String::from)
    .collect();
    match randomization {
        RandomizeSnat::None => {}
        RandomizeSnat::HashRandom => args.push("--random".to_string()),
        RandomizeSnat::Prng if random_fully => args.push("--random-fully".to_string()),
        RandomizeSnat::Prng => {
            warn!("iptables does not support --random-fully, falling back to --random");
            args.push("--random".to_string());
        }
    }
    RuleSpec::new(args)
}

/// Inputs of one SNAT reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatSettings {
    /// `false` when SNAT is done outside the node: every managed chain is torn down.
    pub enabled: bool,
    pub vpc_cidrs: Vec<Ipv4Net>,
    /// Operator supplied destinations which are not translated either.
    pub exclusions: Vec<Ipv4Net>,
    /// Address traffic is translated to, the primary address of the node.
    pub source: Ipv4Addr,
    pub randomization: RandomizeSnat,
}

/// A chain and the single rule it must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChain {
    pub name: String,
    pub rule: RuleSpec,
}

/// The desired chain sequence, terminal chain last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatPlan {
    chains: Vec<PlannedChain>,
}

impl SnatPlan {
    /// One exclusion chain per VPC CIDR, then one per exclusion, then the SNAT chain.
    #[must_use]
    pub fn new(settings: &SnatSettings, random_fully: bool) -> SnatPlan {
        let excluded = settings
            .vpc_cidrs
            .iter()
            .map(|cidr| (cidr.trunc(), CHAIN_COMMENT))
            .chain(
                settings
                    .exclusions
                    .iter()
                    .map(|cidr| (cidr.trunc(), EXCLUSION_COMMENT)),
            );
        let mut chains: Vec<PlannedChain> = excluded
            .enumerate()
            .map(|(i, (cidr, comment))| PlannedChain {
                name: chain_name(i),
                rule: exclusion_rule(cidr, comment, &chain_name(i + 1)),
            })
            .collect();
        chains.push(PlannedChain {
            name: chain_name(chains.len()),
            rule: snat_rule(settings.source, settings.randomization, random_fully),
        });
        SnatPlan { chains }
    }

    #[must_use]
    pub fn chains(&self) -> &[PlannedChain] {
        &self.chains
    }

    /// Number of chains, terminal included; never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// What a reconciliation changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnatChanges {
    pub appended: usize,
    pub deleted: usize,
    pub chains_created: usize,
    pub chains_removed: usize,
}

impl SnatChanges {
    /// True if the tables were already converged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == SnatChanges::default()
    }
}

/// Managed chains present in the nat table, by ascending index.
fn managed_chains<I: Iptables + ?Sized>(iptables: &I) -> Result<Vec<(usize, String)>, NetworkError> {
    let mut chains: Vec<(usize, String)> = iptables
        .list_chains(SNAT_TABLE)?
        .into_iter()
        .filter_map(|name| chain_index(&name).map(|i| (i, name)))
        .collect();
    chains.sort_unstable();
    Ok(chains)
}

fn chain_rules<I: Iptables + ?Sized>(iptables: &I, chain: &str) -> Result<Vec<RuleSpec>, NetworkError> {
    Ok(iptables
        .list(SNAT_TABLE, chain)?
        .iter()
        .filter_map(|line| RuleSpec::from_listing(chain, line))
        .collect())
}

/// Leave `planned.rule` as the only rule of its chain.
fn converge_chain<I: Iptables + ?Sized>(
    iptables: &I,
    planned: &PlannedChain,
    changes: &mut SnatChanges,
) -> Result<(), NetworkError> {
    let current = chain_rules(iptables, &planned.name)?;
    if !current.contains(&planned.rule) {
        iptables.append(SNAT_TABLE, &planned.name, &planned.rule)?;
        changes.appended += 1;
        info!("{}: added {}", planned.name, planned.rule);
    }
    let mut kept = false;
    for rule in &current {
        if *rule == planned.rule && !kept {
            kept = true;
            continue;
        }
        iptables.delete(SNAT_TABLE, &planned.name, rule)?;
        changes.deleted += 1;
        info!("{}: removed {rule}", planned.name);
    }
    Ok(())
}

fn remove_if_present<I: Iptables + ?Sized>(
    iptables: &I,
    chain: &str,
    rule: &RuleSpec,
    changes: &mut SnatChanges,
) -> Result<(), NetworkError> {
    if iptables.exists(SNAT_TABLE, chain, rule)? {
        iptables.delete(SNAT_TABLE, chain, rule)?;
        changes.deleted += 1;
        info!("{chain}: removed {rule}");
    }
    Ok(())
}

/// Flush every chain first so none is still referenced by another when it is deleted.
fn remove_chains<I: Iptables + ?Sized>(
    iptables: &I,
    chains: &[(usize, String)],
    changes: &mut SnatChanges,
) -> Result<(), NetworkError> {
    for (_, name) in chains {
        iptables.clear_chain(SNAT_TABLE, name)?;
    }
    for (_, name) in chains {
        iptables.delete_chain(SNAT_TABLE, name)?;
        changes.chains_removed += 1;
        info!("removed chain {name}");
    }
    Ok(())
}

/// Converge the nat table to `settings`.
///
/// Chains are filled from the terminal chain backwards, so a jump never leads into a
/// chain which is not populated yet. Chains beyond the desired sequence are removed last.
///
/// # Errors
///
/// [`NetworkError::Firewall`] on the first failing iptables operation; the next
/// reconciliation picks up from whatever state was left.
#[tracing::instrument(level = "info", skip_all, fields(enabled = settings.enabled))]
pub fn reconcile_snat<I: Iptables + ?Sized>(
    iptables: &I,
    settings: &SnatSettings,
) -> Result<SnatChanges, NetworkError> {
    let mut changes = SnatChanges::default();
    let existing = managed_chains(iptables)?;
    let canonical = dispatch_rule(CHAIN_COMMENT);
    let legacy = dispatch_rule(LEGACY_CHAIN_COMMENT);

    if !settings.enabled {
        remove_if_present(iptables, SNAT_DISPATCH_CHAIN, &canonical, &mut changes)?;
        remove_if_present(iptables, SNAT_DISPATCH_CHAIN, &legacy, &mut changes)?;
        remove_chains(iptables, &existing, &mut changes)?;
        debug!("SNAT disabled: {changes:?}");
        return Ok(changes);
    }

    let plan = SnatPlan::new(settings, iptables.has_random_fully());
    for planned in plan.chains() {
        if !existing.iter().any(|(_, name)| *name == planned.name) {
            iptables.new_chain(SNAT_TABLE, &planned.name)?;
            changes.chains_created += 1;
            info!("created chain {}", planned.name);
        }
    }
    for planned in plan.chains().iter().rev() {
        converge_chain(iptables, planned, &mut changes)?;
    }

    if !iptables.exists(SNAT_TABLE, SNAT_DISPATCH_CHAIN, &canonical)? {
        iptables.append(SNAT_TABLE, SNAT_DISPATCH_CHAIN, &canonical)?;
        changes.appended += 1;
        info!("{SNAT_DISPATCH_CHAIN}: added {canonical}");
    }
    remove_if_present(iptables, SNAT_DISPATCH_CHAIN, &legacy, &mut changes)?;

    let stale: Vec<(usize, String)> = existing
        .into_iter()
        .filter(|(index, _)| *index >= plan.len())
        .collect();
    remove_chains(iptables, &stale, &mut changes)?;

    debug!("SNAT converged with {} chain(s): {changes:?}", plan.len());
    Ok(changes)
}

/// Remove the single SNAT rule older releases put straight into POSTROUTING.
///
/// # Errors
///
/// [`NetworkError::Firewall`] if the rule cannot be checked or removed.
pub fn remove_legacy_snat_rule<I: Iptables + ?Sized>(
    iptables: &I,
    vpc_cidr: Ipv4Net,
    source: Ipv4Addr,
) -> Result<bool, NetworkError> {
    let vpc_cidr = vpc_cidr.to_string();
    let source = source.to_string();
    let rule = RuleSpec::from([
        "!",
        "-d",
        vpc_cidr.as_str(),
        "-m",
        "comment",
        "--comment",
        SNAT_COMMENT,
        "-m",
        "addrtype",
        "!",
        "--dst-type",
        "LOCAL",
        "-j",
        "SNAT",
        "--to-source",
        source.as_str(),
    ]);
    let mut changes = SnatChanges::default();
    remove_if_present(iptables, SNAT_DISPATCH_CHAIN, &rule, &mut changes)?;
    Ok(changes.deleted > 0)
}
