// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bring a secondary ENI online.
//!
//! Every step checks or replaces state rather than assuming a clean device, so a bring-up
//! interrupted half way is finished by simply running it again.

use crate::backend::{Link, NetLink, NetlinkError};
use crate::errors::NetworkError;
use crate::resolver::resolve_link_by_mac;
use crate::route::{MAIN_TABLE, Route, RouteScope};
use ipnet::Ipv4Net;
use net::eth::mac::Mac;
use net::interface::Mtu;
use net::ipv4::first_usable;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One attached ENI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EniConfig {
    pub address: Ipv4Addr,
    pub mac: Mac,
    /// Routing table of the ENI; `0` marks the primary ENI, which keeps the kernel's routing.
    pub table: u32,
    pub subnet: Ipv4Net,
    pub mtu: Mtu,
}

impl EniConfig {
    /// The address as assigned to the device, with the subnet's prefix length.
    #[must_use]
    pub fn interface_address(&self) -> Ipv4Net {
        // the prefix length comes from a valid Ipv4Net
        Ipv4Net::new(self.address, self.subnet.prefix_len()).unwrap_or(self.subnet)
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.table == 0
    }
}

/// Bounds on the two waits of an ENI bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Link table polls while waiting for the device to appear.
    pub link_attempts: u32,
    pub link_interval: Duration,
    /// Route installs retried while the gateway is unreachable.
    pub route_add_attempts: u32,
    pub route_add_interval: Duration,
}

impl RetryPolicy {
    /// The same bounds without any sleeping.
    #[must_use]
    pub fn without_delay(self) -> RetryPolicy {
        RetryPolicy {
            link_interval: Duration::ZERO,
            route_add_interval: Duration::ZERO,
            ..self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            link_attempts: 5,
            link_interval: Duration::from_secs(3),
            route_add_attempts: 5,
            route_add_interval: Duration::from_secs(5),
        }
    }
}

fn device_error(link: &Link, action: &'static str, source: NetlinkError) -> NetworkError {
    NetworkError::DeviceConfig {
        interface: link.name.to_string(),
        action,
        source,
    }
}

/// Bring up the ENI described by `config` and build its routing table.
///
/// The primary ENI (table `0`) is left alone entirely.
///
/// # Errors
///
/// * [`NetworkError::InterfaceNotFound`] if the device never appears,
/// * [`NetworkError::DeviceConfig`] if the MTU, admin state or address cannot be set,
/// * [`NetworkError::RouteConvergence`] if a route cannot be installed,
/// * [`NetworkError::AddressOverflow`] if the subnet has no gateway address.
#[tracing::instrument(level = "info", skip(netlink, retry), fields(mac = %config.mac, table = config.table))]
pub fn setup_eni_network<N: NetLink + ?Sized>(
    netlink: &N,
    config: &EniConfig,
    retry: &RetryPolicy,
) -> Result<(), NetworkError> {
    if config.is_primary() {
        debug!("primary ENI: routing stays with the kernel");
        return Ok(());
    }
    let link = resolve_link_by_mac(netlink, config.mac, retry.link_attempts, retry.link_interval)?;

    netlink
        .link_set_mtu(&link, config.mtu)
        .map_err(|e| device_error(&link, "set mtu", e))?;
    netlink
        .link_set_up(&link)
        .map_err(|e| device_error(&link, "set link up", e))?;
    match netlink.link_by_index(link.index) {
        Ok(current) if !current.up => warn!("{link} still reports admin state down"),
        Ok(_) => {}
        Err(e) => warn!("unable to read back {link}: {e}"),
    }
    info!("{link} is up with mtu {}", config.mtu);

    ensure_address(netlink, &link, config.interface_address())?;

    let gateway = first_usable(&config.subnet)?;
    replace_route(
        netlink,
        &Route::on_link(config.subnet, link.index, config.table),
        retry,
    )?;
    replace_route(
        netlink,
        &Route::default_via(gateway, link.index, config.table),
        retry,
    )?;

    // Adding the address made the kernel install a subnet route in the main table.
    // Pod traffic for the subnet must follow the policy rules instead.
    let kernel_route = Route {
        source: Some(config.address),
        ..Route::on_link(config.subnet, link.index, MAIN_TABLE)
    };
    match netlink.route_del(&kernel_route) {
        Ok(()) => debug!("removed main table route {kernel_route}"),
        Err(NetlinkError::NotFound) => {}
        Err(e) => warn!("unable to remove main table route {kernel_route}: {e}"),
    }
    Ok(())
}

fn ensure_address<N: NetLink + ?Sized>(
    netlink: &N,
    link: &Link,
    address: Ipv4Net,
) -> Result<(), NetworkError> {
    let assigned = netlink
        .addr_list(link)
        .map_err(|e| device_error(link, "list addresses", e))?;
    if assigned.contains(&address) {
        debug!("{address} already assigned to {link}");
        return Ok(());
    }
    match netlink.addr_add(link, address) {
        Ok(()) => {
            info!("assigned {address} to {link}");
            Ok(())
        }
        Err(NetlinkError::Exists) => {
            debug!("{address} appeared on {link} concurrently");
            Ok(())
        }
        Err(e) => Err(device_error(link, "add address", e)),
    }
}

/// Clear whatever route holds the destination, then install `route`.
///
/// The destination must be free once cleared: an add refused as a duplicate means a
/// foreign route survived and is a convergence failure.
fn replace_route<N: NetLink + ?Sized>(
    netlink: &N,
    route: &Route,
    retry: &RetryPolicy,
) -> Result<(), NetworkError> {
    let clear_failure = match netlink.route_del(&route.deletion_key()) {
        Ok(()) => {
            debug!("removed previous route for {} table {}", route.destination, route.table);
            None
        }
        Err(NetlinkError::NotFound) => None,
        Err(e) => {
            warn!("failed to clear {} table {}: {e}", route.destination, route.table);
            Some(e)
        }
    };
    let attempts = retry.route_add_attempts.max(1);
    let mut attempt = 1;
    loop {
        match netlink.route_add(route) {
            Ok(()) => {
                info!("installed route {route}");
                return Ok(());
            }
            Err(NetlinkError::Unreachable) if attempt < attempts => {
                warn!("gateway of {route} unreachable (attempt {attempt}/{attempts}), retrying");
                if !retry.route_add_interval.is_zero() {
                    std::thread::sleep(retry.route_add_interval);
                }
                attempt += 1;
            }
            Err(NetlinkError::Exists) => {
                return Err(NetworkError::RouteConvergence {
                    route: route.to_string(),
                    source: clear_failure.unwrap_or(NetlinkError::Exists),
                });
            }
            Err(source) => {
                return Err(NetworkError::RouteConvergence {
                    route: route.to_string(),
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::backend::NetlinkError;
    use crate::eni::{EniConfig, RetryPolicy, setup_eni_network};
    use crate::errors::NetworkError;
    use crate::route::{MAIN_TABLE, Route};
    use crate::testing::{
        MemNetLink, NetlinkCall, Op, TEST_ENI_IP, TEST_ENI_SUBNET, TEST_MAC2, TEST_MTU,
        TEST_TABLE, link, loopback,
    };
    use ipnet::Ipv4Net;
    use net::interface::{InterfaceIndex, Mtu};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use tracing_test::traced_test;

    fn config(table: u32) -> EniConfig {
        EniConfig {
            address: TEST_ENI_IP.parse().unwrap(),
            mac: TEST_MAC2.parse().unwrap(),
            table,
            subnet: TEST_ENI_SUBNET.parse().unwrap(),
            mtu: Mtu::try_from(TEST_MTU).unwrap(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::default().without_delay()
    }

    fn eni_netlink() -> MemNetLink {
        let netlink = MemNetLink::new();
        netlink.script_link_list(Ok(vec![loopback()]));
        netlink.add_link(loopback());
        netlink.add_link(link(2, "eth1", TEST_MAC2));
        netlink
    }

    #[test]
    #[traced_test]
    fn bring_up_sequence() {
        let netlink = eni_netlink();
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();

        let index = InterfaceIndex::try_new(2).unwrap();
        let subnet: Ipv4Net = TEST_ENI_SUBNET.parse().unwrap();
        let address: Ipv4Net = "10.10.10.20/16".parse().unwrap();
        let local = Route::on_link(subnet, index, TEST_TABLE);
        let default = Route::default_via(Ipv4Addr::new(10, 10, 0, 1), index, TEST_TABLE);
        let kernel_route = Route {
            source: Some(Ipv4Addr::new(10, 10, 10, 20)),
            ..Route::on_link(subnet, index, MAIN_TABLE)
        };
        assert_eq!(
            netlink.calls(),
            vec![
                NetlinkCall::LinkList,
                NetlinkCall::LinkList,
                NetlinkCall::LinkSetMtu(index, Mtu::try_from(TEST_MTU).unwrap()),
                NetlinkCall::LinkSetUp(index),
                NetlinkCall::LinkByIndex(index),
                NetlinkCall::AddrList(index),
                NetlinkCall::AddrAdd(index, address),
                NetlinkCall::RouteDel(local.deletion_key()),
                NetlinkCall::RouteAdd(local.clone()),
                NetlinkCall::RouteDel(default.deletion_key()),
                NetlinkCall::RouteAdd(default.clone()),
                NetlinkCall::RouteDel(kernel_route),
            ]
        );
        assert_eq!(netlink.routes_in(TEST_TABLE), vec![local, default]);
        assert_eq!(netlink.addresses(index), vec![address]);
        let eth1 = netlink.link_state(index).unwrap();
        assert!(eth1.up);
        assert_eq!(eth1.mtu, TEST_MTU);
        assert!(logs_contain("installed route default via 10.10.0.1 dev 2 table 10"));
    }

    #[test]
    fn bring_up_twice_converges_to_the_same_state() {
        let netlink = eni_netlink();
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        let routes = netlink.routes();
        let index = InterfaceIndex::try_new(2).unwrap();
        let addresses = netlink.addresses(index);

        netlink.clear_calls();
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        assert_eq!(netlink.routes(), routes);
        assert_eq!(netlink.addresses(index), addresses);
        assert!(
            !netlink
                .calls()
                .iter()
                .any(|call| matches!(call, NetlinkCall::AddrAdd(..)))
        );
    }

    #[test]
    fn stale_routes_are_replaced() {
        let netlink = eni_netlink();
        let index = InterfaceIndex::try_new(2).unwrap();
        let stale = Route::default_via(Ipv4Addr::new(10, 10, 0, 254), index, TEST_TABLE);
        netlink.insert_route(stale.clone());
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        let routes = netlink.routes_in(TEST_TABLE);
        assert!(!routes.contains(&stale));
        assert_eq!(routes.len(), 2);
        assert!(routes.contains(&Route::default_via(
            Ipv4Addr::new(10, 10, 0, 1),
            index,
            TEST_TABLE
        )));
    }

    #[test]
    fn main_table_subnet_route_is_removed() {
        let netlink = eni_netlink();
        let index = InterfaceIndex::try_new(2).unwrap();
        let kernel_route = Route {
            source: Some(Ipv4Addr::new(10, 10, 10, 20)),
            ..Route::on_link(TEST_ENI_SUBNET.parse().unwrap(), index, MAIN_TABLE)
        };
        netlink.insert_route(kernel_route);
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        assert!(netlink.routes_in(MAIN_TABLE).is_empty());
    }

    #[test]
    fn primary_eni_makes_no_kernel_call() {
        let netlink = eni_netlink();
        setup_eni_network(&netlink, &config(0), &fast()).unwrap();
        assert!(netlink.calls().is_empty());
    }

    #[test]
    fn missing_device_is_reported() {
        let netlink = MemNetLink::with_links(vec![loopback()]);
        let err = setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::InterfaceNotFound { attempts: 5, .. }
        ));
        assert!(netlink.mutations().is_empty());
    }

    #[test]
    fn mtu_failure_is_fatal() {
        let netlink = eni_netlink();
        netlink.fail(Op::LinkSetMtu, NetlinkError::Other("operation not supported".into()));
        let err = setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::DeviceConfig { action: "set mtu", .. }
        ));
        assert!(
            !netlink
                .calls()
                .iter()
                .any(|call| matches!(call, NetlinkCall::LinkSetUp(_)))
        );
    }

    #[test]
    fn address_add_failure_is_fatal() {
        let netlink = eni_netlink();
        netlink.fail(Op::AddrAdd, NetlinkError::Other("permission denied".into()));
        let err = setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::DeviceConfig {
                action: "add address",
                ..
            }
        ));
        assert!(netlink.routes().is_empty());
    }

    #[test]
    fn unreachable_gateway_is_retried() {
        let netlink = eni_netlink();
        netlink.fail(Op::RouteAdd, NetlinkError::Unreachable);
        netlink.fail(Op::RouteAdd, NetlinkError::Unreachable);
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        assert_eq!(netlink.routes_in(TEST_TABLE).len(), 2);
    }

    #[test]
    fn unreachable_gateway_gives_up() {
        let netlink = eni_netlink();
        let retry = RetryPolicy {
            route_add_attempts: 2,
            ..fast()
        };
        netlink.fail(Op::RouteAdd, NetlinkError::Unreachable);
        netlink.fail(Op::RouteAdd, NetlinkError::Unreachable);
        let err = setup_eni_network(&netlink, &config(TEST_TABLE), &retry).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::RouteConvergence {
                source: NetlinkError::Unreachable,
                ..
            }
        ));
    }

    #[test]
    fn route_add_failure_is_fatal() {
        let netlink = eni_netlink();
        netlink.fail(Op::RouteAdd, NetlinkError::Other("invalid argument".into()));
        let err = setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap_err();
        assert!(matches!(err, NetworkError::RouteConvergence { .. }));
        let adds = netlink
            .calls()
            .into_iter()
            .filter(|call| matches!(call, NetlinkCall::RouteAdd(_)))
            .count();
        assert_eq!(adds, 1);
    }

    #[test]
    fn stale_route_on_another_device_is_replaced() {
        let netlink = eni_netlink();
        let index = InterfaceIndex::try_new(2).unwrap();
        let other = InterfaceIndex::try_new(7).unwrap();
        let stale = Route::default_via(Ipv4Addr::new(10, 10, 0, 254), other, TEST_TABLE);
        netlink.insert_route(stale.clone());
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        let routes = netlink.routes_in(TEST_TABLE);
        assert!(!routes.contains(&stale));
        assert_eq!(
            routes,
            vec![
                Route::on_link(TEST_ENI_SUBNET.parse().unwrap(), index, TEST_TABLE),
                Route::default_via(Ipv4Addr::new(10, 10, 0, 1), index, TEST_TABLE),
            ]
        );
    }

    #[test]
    #[traced_test]
    fn surviving_stale_route_fails_convergence() {
        let netlink = eni_netlink();
        let index = InterfaceIndex::try_new(2).unwrap();
        let stale = Route::default_via(Ipv4Addr::new(10, 10, 0, 254), index, TEST_TABLE);
        netlink.insert_route(stale.clone());
        netlink.fail(Op::RouteDel, NetlinkError::Other("device busy".into()));
        netlink.fail(Op::RouteDel, NetlinkError::Other("device busy".into()));
        let err = setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::RouteConvergence {
                source: NetlinkError::Other(ref reason),
                ..
            } if reason == "device busy"
        ));
        assert!(netlink.routes_in(TEST_TABLE).contains(&stale));
        assert!(logs_contain("failed to clear 0.0.0.0/0 table 10: "));
    }

    #[test]
    fn route_delete_failure_is_not_fatal() {
        let netlink = eni_netlink();
        netlink.fail(Op::RouteDel, NetlinkError::Other("device busy".into()));
        setup_eni_network(&netlink, &config(TEST_TABLE), &fast()).unwrap();
        assert_eq!(netlink.routes_in(TEST_TABLE).len(), 2);
    }

    #[test]
    fn interface_address_keeps_host_bits() {
        assert_eq!(
            config(TEST_TABLE).interface_address(),
            "10.10.10.20/16".parse::<Ipv4Net>().unwrap()
        );
    }
}
