// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command line and environment configuration of the host network agent.
//!
//! Every knob the engine honors can be given either as a flag or through the environment
//! variable the node's CNI daemon set already exports.

#![deny(clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub use clap::Parser;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Subcommand, ValueEnum};
use ipnet::Ipv4Net;
use net::eth::mac::Mac;
use net::interface::Mtu;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::warn;

pub const ENV_MTU: &str = "AWS_VPC_ENI_MTU";
pub const ENV_EXCLUDE_SNAT_CIDRS: &str = "AWS_VPC_K8S_CNI_EXCLUDE_SNAT_CIDRS";
pub const ENV_EXTERNAL_SNAT: &str = "AWS_VPC_K8S_CNI_EXTERNALSNAT";
pub const ENV_NODE_PORT_SUPPORT: &str = "AWS_VPC_CNI_NODE_PORT_SUPPORT";
pub const ENV_CONNMARK: &str = "AWS_VPC_K8S_CNI_CONNMARK";
pub const ENV_RANDOMIZE_SNAT: &str = "AWS_VPC_K8S_CNI_RANDOMIZESNAT";

/// Connmark bit used to tag connections arriving on the primary ENI.
pub const DEFAULT_CONNMARK: u32 = 0x80;

/// Errors produced while interpreting individual argument values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum InvalidArgument {
    #[error("'{0}' is not a valid MTU")]
    Mtu(String),
    #[error("'{0}' is not a valid connection mark; expected decimal or 0x prefixed hex")]
    Connmark(String),
    #[error("connection mark may not be zero")]
    ZeroConnmark,
}

/// Port randomization applied to the SNAT target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RandomizeSnat {
    /// No randomization flag.
    None,
    /// `--random`
    #[default]
    #[value(name = "hashrandom")]
    HashRandom,
    /// `--random-fully`, where iptables supports it.
    Prng,
}

/// A comma separated list of IPv4 CIDRs.
///
/// Malformed entries are dropped with a warning rather than failing the whole list; host bits
/// are cleared, as `iptables -S` lists them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CidrList(pub Vec<Ipv4Net>);

impl FromStr for CidrList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cidrs = s
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match entry.parse::<Ipv4Net>() {
                Ok(cidr) => Some(cidr.trunc()),
                Err(e) => {
                    warn!("ignoring invalid CIDR '{entry}' in exclusion list: {e}");
                    None
                }
            })
            .collect();
        Ok(CidrList(cidrs))
    }
}

/// Parse an MTU, clamping it into the range the VPC supports.
///
/// # Errors
///
/// Returns [`InvalidArgument::Mtu`] if the value is not an integer.
pub fn parse_mtu(value: &str) -> Result<Mtu, InvalidArgument> {
    let raw = value
        .trim()
        .parse::<u32>()
        .map_err(|_| InvalidArgument::Mtu(value.to_string()))?;
    let mtu = Mtu::clamped(raw);
    if mtu.to_u32() != raw {
        warn!("mtu {raw} is outside of [{}, {}], using {mtu}", Mtu::MIN, Mtu::MAX);
    }
    Ok(mtu)
}

/// Parse a connection mark given either in decimal or as `0x` prefixed hex.
///
/// # Errors
///
/// Returns [`InvalidArgument`] if the value is not a number or is zero.
pub fn parse_connmark(value: &str) -> Result<u32, InvalidArgument> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse::<u32>(),
    };
    match parsed {
        Ok(0) => Err(InvalidArgument::ZeroConnmark),
        Ok(mark) => Ok(mark),
        Err(_) => Err(InvalidArgument::Connmark(value.to_string())),
    }
}

/// Host wide network settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct NetworkArgs {
    #[arg(
        long,
        env = ENV_MTU,
        value_name = "BYTES",
        default_value = "9001",
        value_parser = parse_mtu,
        help = "MTU of secondary ENIs, clamped to [576, 9001]"
    )]
    mtu: Mtu,

    #[arg(
        long,
        env = ENV_EXCLUDE_SNAT_CIDRS,
        value_name = "CIDR[,CIDR...]",
        help = "Comma separated CIDRs that pod traffic may reach without SNAT"
    )]
    exclude_snat_cidrs: Option<CidrList>,

    #[arg(
        long,
        env = ENV_EXTERNAL_SNAT,
        value_name = "BOOL",
        action = ArgAction::Set,
        default_value_t = false,
        value_parser = BoolishValueParser::new(),
        help = "Leave SNAT of pod traffic to an external NAT device"
    )]
    external_snat: bool,

    #[arg(
        long,
        env = ENV_NODE_PORT_SUPPORT,
        value_name = "BOOL",
        action = ArgAction::Set,
        default_value_t = true,
        value_parser = BoolishValueParser::new(),
        help = "Mark and restore connections on the primary ENI so node ports answer through it"
    )]
    node_port_support: bool,

    #[arg(
        long,
        env = ENV_CONNMARK,
        value_name = "MARK",
        default_value = "0x80",
        value_parser = parse_connmark,
        help = "Connection mark bit for traffic arriving on the primary ENI"
    )]
    connmark: u32,

    #[arg(
        long,
        env = ENV_RANDOMIZE_SNAT,
        value_enum,
        default_value_t = RandomizeSnat::HashRandom,
        help = "Source port randomization of the SNAT rule"
    )]
    randomize_snat: RandomizeSnat,
}

impl NetworkArgs {
    pub fn mtu(&self) -> Mtu {
        self.mtu
    }

    #[must_use]
    pub fn external_snat(&self) -> bool {
        self.external_snat
    }

    /// CIDRs excluded from SNAT.
    ///
    /// Empty when SNAT is left to an external device, as no chain is built to hold them.
    #[must_use]
    pub fn exclude_snat_cidrs(&self) -> Vec<Ipv4Net> {
        if self.external_snat {
            return Vec::new();
        }
        self.exclude_snat_cidrs
            .as_ref()
            .map(|list| list.0.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn node_port_support(&self) -> bool {
        self.node_port_support
    }

    #[must_use]
    pub fn connmark(&self) -> u32 {
        self.connmark
    }

    #[must_use]
    pub fn randomize_snat(&self) -> RandomizeSnat {
        self.randomize_snat
    }
}

impl Default for NetworkArgs {
    fn default() -> Self {
        NetworkArgs {
            mtu: Mtu::DEFAULT,
            exclude_snat_cidrs: None,
            external_snat: false,
            node_port_support: true,
            connmark: DEFAULT_CONNMARK,
            randomize_snat: RandomizeSnat::default(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct EniArgs {
    #[arg(long, value_name = "IPV4", help = "Primary address of the ENI")]
    pub address: Ipv4Addr,
    #[arg(long, value_name = "MAC", help = "Hardware address of the attached ENI")]
    pub mac: Mac,
    #[arg(long, value_name = "ID", help = "Routing table of the ENI; 0 for the primary ENI")]
    pub table: u32,
    #[arg(long, value_name = "CIDR", help = "Subnet the ENI lives in")]
    pub subnet: Ipv4Net,
}

#[derive(Debug, Clone, Args)]
pub struct HostArgs {
    #[arg(long, value_name = "CIDR", help = "Primary CIDR of the VPC")]
    pub vpc_cidr: Ipv4Net,
    #[arg(
        long,
        value_name = "CIDR",
        value_delimiter = ',',
        help = "All CIDRs of the VPC, comma separated"
    )]
    pub vpc_cidrs: Vec<Ipv4Net>,
    #[arg(long, value_name = "MAC", help = "Hardware address of the primary ENI")]
    pub primary_mac: Mac,
    #[arg(long, value_name = "IPV4", help = "Primary address of the primary ENI")]
    pub primary_address: Ipv4Addr,
}

#[derive(Debug, Clone, Args)]
pub struct RuleArgs {
    #[arg(long, value_name = "CIDR", help = "Pod source CIDR whose rules are replaced")]
    pub source: Ipv4Net,
    #[arg(
        long,
        value_name = "CIDR",
        value_delimiter = ',',
        help = "VPC CIDRs the pod reaches without SNAT, comma separated"
    )]
    pub vpc_cidrs: Vec<Ipv4Net>,
    #[arg(
        long,
        action = ArgAction::Set,
        default_value_t = true,
        value_parser = BoolishValueParser::new(),
        help = "Restrict the rules to VPC destinations so other traffic is SNATed"
    )]
    pub requires_snat: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Bring up a freshly attached secondary ENI
    SetupEni(EniArgs),
    /// Reconcile host wide rules, SNAT chains and connmark rules
    SetupHost(HostArgs),
    /// Replace the policy rules of one pod source address
    UpdateRules(RuleArgs),
}

#[derive(Debug, Parser)]
#[command(name = "vpcnet-agent")]
#[command(version)]
#[command(about = "Host network configuration for ENI backed pod networking", long_about = None)]
pub struct CmdArgs {
    #[command(flatten)]
    network: NetworkArgs,

    #[arg(
        long,
        value_name = "FILTER",
        help = "Log filter, e.g. info or vpcnet_hostnet=debug; falls back to RUST_LOG"
    )]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl CmdArgs {
    pub fn network(&self) -> &NetworkArgs {
        &self.network
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        CidrList, CmdArgs, Command, DEFAULT_CONNMARK, InvalidArgument, NetworkArgs,
        RandomizeSnat, parse_connmark, parse_mtu,
    };
    use clap::Parser;
    use ipnet::Ipv4Net;
    use net::interface::Mtu;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;
    use tracing_test::traced_test;

    fn cidr(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    #[traced_test]
    fn mtu_too_low_is_clamped() {
        assert_eq!(parse_mtu("1").unwrap(), Mtu::MIN);
        assert!(logs_contain("outside of"));
    }

    #[test]
    fn mtu_in_range_is_kept() {
        assert_eq!(parse_mtu("1500").unwrap().to_u32(), 1500);
    }

    #[test]
    fn mtu_too_high_is_clamped() {
        assert_eq!(parse_mtu("65536").unwrap(), Mtu::MAX);
    }

    #[test]
    fn mtu_must_be_numeric() {
        assert_eq!(parse_mtu("jumbo"), Err(InvalidArgument::Mtu("jumbo".into())));
    }

    #[test]
    fn exclusion_list() {
        let list = CidrList::from_str("10.12.0.0/16,10.13.0.0/16").unwrap();
        assert_eq!(list.0, vec![cidr("10.12.0.0/16"), cidr("10.13.0.0/16")]);
    }

    #[test]
    fn exclusion_list_clears_host_bits() {
        let list = CidrList::from_str("10.12.0.5/16,10.13.7.9/24").unwrap();
        assert_eq!(list.0, vec![cidr("10.12.0.0/16"), cidr("10.13.7.0/24")]);
    }

    #[test]
    #[traced_test]
    fn exclusion_list_skips_invalid_entries() {
        let list = CidrList::from_str("10.12.0.0/16, bogus ,,10.13.0.0/33,10.14.0.0/16").unwrap();
        assert_eq!(list.0, vec![cidr("10.12.0.0/16"), cidr("10.14.0.0/16")]);
        assert!(logs_contain("bogus"));
    }

    #[test]
    fn connmark_formats() {
        assert_eq!(parse_connmark("0x80"), Ok(0x80));
        assert_eq!(parse_connmark("0X100"), Ok(0x100));
        assert_eq!(parse_connmark("128"), Ok(128));
        assert_eq!(parse_connmark("0"), Err(InvalidArgument::ZeroConnmark));
        assert!(matches!(
            parse_connmark("0xzz"),
            Err(InvalidArgument::Connmark(_))
        ));
    }

    #[test]
    fn defaults() {
        let args = CmdArgs::try_parse_from([
            "vpcnet-agent",
            "update-rules",
            "--source",
            "10.10.10.20/32",
        ])
        .unwrap();
        let network = args.network();
        let defaults = NetworkArgs::default();
        assert_eq!(network.mtu(), defaults.mtu());
        assert_eq!(network.connmark(), DEFAULT_CONNMARK);
        assert!(network.node_port_support());
        assert!(!network.external_snat());
        assert_eq!(network.randomize_snat(), RandomizeSnat::HashRandom);
        assert!(network.exclude_snat_cidrs().is_empty());
        match args.command() {
            Command::UpdateRules(rules) => {
                assert_eq!(rules.source, cidr("10.10.10.20/32"));
                assert!(rules.requires_snat);
                assert!(rules.vpc_cidrs.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn exclusions_ignored_with_external_snat() {
        let args = CmdArgs::try_parse_from([
            "vpcnet-agent",
            "--external-snat",
            "true",
            "--exclude-snat-cidrs",
            "10.12.0.0/16",
            "update-rules",
            "--source",
            "10.10.10.20/32",
        ])
        .unwrap();
        assert!(args.network().external_snat());
        assert!(args.network().exclude_snat_cidrs().is_empty());
    }

    #[test]
    fn host_command() {
        let args = CmdArgs::try_parse_from([
            "vpcnet-agent",
            "--node-port-support",
            "false",
            "--randomize-snat",
            "prng",
            "--exclude-snat-cidrs",
            "10.12.0.0/16,10.13.0.0/16",
            "setup-host",
            "--vpc-cidr",
            "10.10.0.0/16",
            "--vpc-cidrs",
            "10.10.0.0/16,10.11.0.0/16",
            "--primary-mac",
            "01:23:45:67:89:a0",
            "--primary-address",
            "10.10.10.20",
        ])
        .unwrap();
        assert!(!args.network().node_port_support());
        assert_eq!(args.network().randomize_snat(), RandomizeSnat::Prng);
        assert_eq!(
            args.network().exclude_snat_cidrs(),
            vec![cidr("10.12.0.0/16"), cidr("10.13.0.0/16")]
        );
        let Command::SetupHost(host) = args.command() else {
            panic!("expected setup-host");
        };
        assert_eq!(host.vpc_cidr, cidr("10.10.0.0/16"));
        assert_eq!(
            host.vpc_cidrs,
            vec![cidr("10.10.0.0/16"), cidr("10.11.0.0/16")]
        );
        assert_eq!(host.primary_mac.to_string(), "01:23:45:67:89:a0");
    }

    #[test]
    fn eni_command_rejects_bad_mac() {
        assert!(
            CmdArgs::try_parse_from([
                "vpcnet-agent",
                "setup-eni",
                "--address",
                "10.10.10.20",
                "--mac",
                "not-a-mac",
                "--table",
                "10",
                "--subnet",
                "10.10.0.0/16",
            ])
            .is_err()
        );
    }

    #[test]
    fn randomize_snat_values() {
        for (value, expected) in [
            ("none", RandomizeSnat::None),
            ("hashrandom", RandomizeSnat::HashRandom),
            ("prng", RandomizeSnat::Prng),
        ] {
            let args = CmdArgs::try_parse_from([
                "vpcnet-agent",
                "--randomize-snat",
                value,
                "update-rules",
                "--source",
                "10.0.0.1/32",
            ])
            .unwrap();
            assert_eq!(args.network().randomize_snat(), expected);
        }
    }
}
