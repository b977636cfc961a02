// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Host wide network state.

use crate::backend::{Iptables, NetLink, NetlinkError, OpenFile};
use crate::connmark::ensure_connmark_rules;
use crate::eni::{EniConfig, RetryPolicy};
use crate::errors::NetworkError;
use crate::procsys::set_loose_rp_filter;
use crate::resolver::resolve_link_by_mac;
use crate::route::{FwMark, MAIN_ENI_RULE_PRIORITY, MAIN_TABLE, PolicyRule};
use crate::snat::{SnatSettings, reconcile_snat, remove_legacy_snat_rule};
use args::{DEFAULT_CONNMARK, NetworkArgs, RandomizeSnat};
use ipnet::Ipv4Net;
use net::eth::mac::Mac;
use net::interface::InterfaceName;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

/// Primary interface assumed when it is not looked up by mac.
pub const DEFAULT_PRIMARY_INTERFACE: &str = "eth0";

/// Host wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetworkConfig {
    /// SNAT is done outside the node; no SNAT chains are kept.
    pub use_external_snat: bool,
    pub exclude_snat_cidrs: Vec<Ipv4Net>,
    /// Mark connections entering on the primary ENI and loosen its reverse path filter.
    pub node_port_support: bool,
    pub main_eni_mark: u32,
    pub snat_randomization: RandomizeSnat,
}

impl Default for HostNetworkConfig {
    fn default() -> Self {
        HostNetworkConfig {
            use_external_snat: false,
            exclude_snat_cidrs: Vec::new(),
            node_port_support: true,
            main_eni_mark: DEFAULT_CONNMARK,
            snat_randomization: RandomizeSnat::default(),
        }
    }
}

impl From<&NetworkArgs> for HostNetworkConfig {
    fn from(args: &NetworkArgs) -> Self {
        HostNetworkConfig {
            use_external_snat: args.external_snat(),
            exclude_snat_cidrs: args.exclude_snat_cidrs(),
            node_port_support: args.node_port_support(),
            main_eni_mark: args.connmark(),
            snat_randomization: args.randomize_snat(),
        }
    }
}

/// The host network engine bound to its backends.
#[derive(Debug)]
pub struct LinuxNetwork<N, I, O> {
    config: HostNetworkConfig,
    netlink: N,
    iptables: I,
    open_file: O,
}

fn delete_rule<N: NetLink + ?Sized>(netlink: &N, rule: &PolicyRule) -> Result<(), NetworkError> {
    match netlink.rule_del(rule) {
        Ok(()) => {
            info!("deleted rule {rule}");
            Ok(())
        }
        Err(NetlinkError::NotFound) => {
            debug!("rule {rule} not present");
            Ok(())
        }
        Err(source) => Err(NetworkError::RuleUpdate {
            action: "delete",
            rule: rule.to_string(),
            source,
        }),
    }
}

impl<N: NetLink, I: Iptables, O: OpenFile> LinuxNetwork<N, I, O> {
    pub fn new(config: HostNetworkConfig, netlink: N, iptables: I, open_file: O) -> Self {
        LinuxNetwork {
            config,
            netlink,
            iptables,
            open_file,
        }
    }

    pub fn config(&self) -> &HostNetworkConfig {
        &self.config
    }

    pub fn netlink(&self) -> &N {
        &self.netlink
    }

    pub fn iptables(&self) -> &I {
        &self.iptables
    }

    pub fn open_file(&self) -> &O {
        &self.open_file
    }

    /// The rule older releases used to send traffic leaving the VPC through the main table.
    fn host_rule(&self, vpc_cidr: Ipv4Net) -> PolicyRule {
        PolicyRule {
            destination: Some(vpc_cidr),
            table: MAIN_TABLE,
            priority: Some(MAIN_ENI_RULE_PRIORITY),
            invert: true,
            ..self.netlink.new_rule()
        }
    }

    /// Route marked connections back out through the main table.
    fn main_eni_rule(&self) -> PolicyRule {
        let mark = self.config.main_eni_mark;
        PolicyRule {
            fwmark: Some(FwMark { mark, mask: mark }),
            table: MAIN_TABLE,
            priority: Some(MAIN_ENI_RULE_PRIORITY),
            ..self.netlink.new_rule()
        }
    }

    fn primary_interface(&self, primary_mac: Mac) -> Result<InterfaceName, NetworkError> {
        if self.config.node_port_support {
            Ok(resolve_link_by_mac(&self.netlink, primary_mac, 1, Duration::ZERO)?.name)
        } else {
            Ok(InterfaceName::try_from(DEFAULT_PRIMARY_INTERFACE)?)
        }
    }

    /// Converge the host wide rules, SNAT chains and connmark rules.
    ///
    /// `vpc_cidr` is the primary CIDR of the VPC, `vpc_cidrs` all of its CIDRs, and
    /// `primary_mac`/`primary_addr` identify the primary ENI of the node.
    ///
    /// # Errors
    ///
    /// The first fatal failure of any step; deletions of absent rules are not failures.
    #[tracing::instrument(level = "info", skip(self, vpc_cidrs), fields(vpc_cidrs = vpc_cidrs.len()))]
    pub fn setup_host_network(
        &self,
        vpc_cidr: Ipv4Net,
        vpc_cidrs: &[Ipv4Net],
        primary_mac: Mac,
        primary_addr: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        delete_rule(&self.netlink, &self.host_rule(vpc_cidr))?;

        let primary = self.primary_interface(primary_mac)?;
        if self.config.node_port_support {
            set_loose_rp_filter(&self.open_file, &primary)?;
        }

        let main_eni_rule = self.main_eni_rule();
        delete_rule(&self.netlink, &main_eni_rule)?;
        if self.config.node_port_support {
            match self.netlink.rule_add(&main_eni_rule) {
                Ok(()) => info!("added rule {main_eni_rule}"),
                Err(NetlinkError::Exists) => debug!("rule {main_eni_rule} already present"),
                Err(source) => {
                    return Err(NetworkError::RuleUpdate {
                        action: "add",
                        rule: main_eni_rule.to_string(),
                        source,
                    });
                }
            }
        }

        let snat = SnatSettings {
            enabled: !self.config.use_external_snat,
            vpc_cidrs: vpc_cidrs.to_vec(),
            exclusions: self.config.exclude_snat_cidrs.clone(),
            source: primary_addr,
            randomization: self.config.snat_randomization,
        };
        let changes = reconcile_snat(&self.iptables, &snat)?;
        debug!("SNAT reconciliation: {changes:?}");

        ensure_connmark_rules(
            &self.iptables,
            &primary,
            self.config.main_eni_mark,
            self.config.node_port_support,
        )?;

        if remove_legacy_snat_rule(&self.iptables, vpc_cidr, primary_addr)? {
            info!("removed legacy SNAT rule for {vpc_cidr}");
        }
        Ok(())
    }

    /// Bring up a secondary ENI, see [`crate::eni::setup_eni_network`].
    ///
    /// # Errors
    ///
    /// As [`crate::eni::setup_eni_network`].
    pub fn setup_eni_network(&self, eni: &EniConfig, retry: &RetryPolicy) -> Result<(), NetworkError> {
        crate::eni::setup_eni_network(&self.netlink, eni, retry)
    }

    /// Replace the policy rules of `source`, see [`crate::rules::update_rule_list_by_src`].
    ///
    /// The configured SNAT exclusions are routed like the VPC CIDRs.
    ///
    /// # Errors
    ///
    /// As [`crate::rules::update_rule_list_by_src`].
    pub fn update_rule_list_by_src(
        &self,
        existing: &[PolicyRule],
        source: Ipv4Net,
        vpc_cidrs: &[Ipv4Net],
        requires_snat: bool,
    ) -> Result<(), NetworkError> {
        let destinations: Vec<Ipv4Net> = vpc_cidrs
            .iter()
            .chain(&self.config.exclude_snat_cidrs)
            .copied()
            .collect();
        crate::rules::update_rule_list_by_src(
            &self.netlink,
            existing,
            source,
            &destinations,
            requires_snat,
        )
    }
}
