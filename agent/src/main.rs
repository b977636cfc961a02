// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use args::{CmdArgs, Command, EniArgs, Parser};
use hostnet::kernel::{KernelIptables, KernelNetLink, OsFileOpener};
use hostnet::{EniConfig, HostNetworkConfig, LinuxNetwork, NetLink, RetryPolicy};
use miette::{IntoDiagnostic, WrapErr};
use net::interface::Mtu;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

const DEFAULT_LOG_FILTER: &str = "info";

/// `--log-level` wins over `RUST_LOG`, which wins over [`DEFAULT_LOG_FILTER`].
fn log_filter(level: Option<&str>) -> Result<EnvFilter, ParseError> {
    match level {
        Some(level) => EnvFilter::try_new(level),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

fn init_logging(args: &CmdArgs) -> miette::Result<()> {
    let filter = log_filter(args.log_level())
        .into_diagnostic()
        .wrap_err("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| miette::miette!("failed to install log subscriber: {e}"))
}

fn eni_config(args: &EniArgs, mtu: Mtu) -> EniConfig {
    EniConfig {
        address: args.address,
        mac: args.mac,
        table: args.table,
        subnet: args.subnet,
        mtu,
    }
}

fn main() -> miette::Result<()> {
    let args = CmdArgs::parse();
    init_logging(&args)?;

    let netlink = KernelNetLink::new()
        .into_diagnostic()
        .wrap_err("failed to open netlink socket")?;
    let iptables = KernelIptables::new()
        .into_diagnostic()
        .wrap_err("failed to initialize iptables")?;
    let network = LinuxNetwork::new(
        HostNetworkConfig::from(args.network()),
        netlink,
        iptables,
        OsFileOpener,
    );

    match args.command() {
        Command::SetupEni(eni) => {
            let config = eni_config(eni, args.network().mtu());
            network
                .setup_eni_network(&config, &RetryPolicy::default())
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to set up ENI {}", eni.mac))?;
            info!("ENI {} ready in table {}", eni.mac, eni.table);
        }
        Command::SetupHost(host) => {
            network
                .setup_host_network(
                    host.vpc_cidr,
                    &host.vpc_cidrs,
                    host.primary_mac,
                    host.primary_address,
                )
                .into_diagnostic()
                .wrap_err("failed to set up host network")?;
            info!("host network converged for {}", host.vpc_cidr);
        }
        Command::UpdateRules(rules) => {
            let existing = network
                .netlink()
                .rule_list()
                .into_diagnostic()
                .wrap_err("failed to list policy rules")?;
            network
                .update_rule_list_by_src(
                    &existing,
                    rules.source,
                    &rules.vpc_cidrs,
                    rules.requires_snat,
                )
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to update rules of {}", rules.source))?;
        }
    }
    Ok(())
}
