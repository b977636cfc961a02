// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{Link, NetLink, NetlinkError};
use crate::route::{PolicyRule, Route, RouteScope};
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use net::eth::mac::Mac;
use net::interface::{InterfaceIndex, InterfaceName, Mtu};
use nix::errno::Errno;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use rtnetlink::packet_route::route::{
    RouteMessage, RouteProtocol, RouteScope as KernelRouteScope, RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleFlags, RuleMessage};
use rtnetlink::{Handle, IpVersion, LinkUnspec, RouteMessageBuilder};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace};

/// [`NetLink`] over an rtnetlink socket.
///
/// The engine is synchronous; every request is driven to completion on a private
/// current thread runtime which also polls the netlink connection.
pub struct KernelNetLink {
    runtime: Runtime,
    handle: Handle,
}

impl std::fmt::Debug for KernelNetLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelNetLink").finish_non_exhaustive()
    }
}

fn classify(err: &rtnetlink::Error) -> NetlinkError {
    if let rtnetlink::Error::NetlinkError(message) = err {
        match Errno::from_raw(-message.raw_code()) {
            Errno::ENOENT | Errno::ESRCH | Errno::ENODEV | Errno::EADDRNOTAVAIL => {
                return NetlinkError::NotFound;
            }
            Errno::EEXIST => return NetlinkError::Exists,
            Errno::ENETUNREACH => return NetlinkError::Unreachable,
            _ => {}
        }
    }
    NetlinkError::Other(err.to_string())
}

impl KernelNetLink {
    /// Open a netlink socket.
    ///
    /// # Errors
    ///
    /// [`NetlinkError::Other`] if the runtime or the socket cannot be created.
    pub fn new() -> Result<KernelNetLink, NetlinkError> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| NetlinkError::Other(format!("failed to start runtime: {e}")))?;
        let handle = runtime.block_on(async {
            let (connection, handle, _) = rtnetlink::new_connection()
                .map_err(|e| NetlinkError::Other(format!("failed to open netlink socket: {e}")))?;
            tokio::spawn(connection);
            Ok::<_, NetlinkError>(handle)
        })?;
        debug!("netlink connection established");
        Ok(KernelNetLink { runtime, handle })
    }

    fn run<T>(&self, request: impl Future<Output = Result<T, rtnetlink::Error>>) -> Result<T, NetlinkError> {
        self.runtime.block_on(request).map_err(|e| {
            let classified = classify(&e);
            trace!("netlink request failed: {e}");
            classified
        })
    }
}

fn link_from_message(message: LinkMessage) -> Option<Link> {
    let index = InterfaceIndex::try_new(message.header.index).ok()?;
    let up = message.header.flags.contains(LinkFlags::Up);
    let mut name = None;
    let mut mac = None;
    let mut mtu = 0;
    for attribute in message.attributes {
        match attribute {
            LinkAttribute::IfName(ifname) => name = InterfaceName::try_from(ifname).ok(),
            LinkAttribute::Address(bytes) => {
                mac = Mac::try_from(bytes.as_slice())
                    .ok()
                    .filter(|mac| !mac.is_zero());
            }
            LinkAttribute::Mtu(value) => mtu = value,
            _ => {}
        }
    }
    Some(Link {
        index,
        name: name?,
        mac,
        mtu,
        up,
    })
}

fn route_message(route: &Route) -> RouteMessage {
    let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
        .destination_prefix(route.destination.network(), route.destination.prefix_len())
        .table_id(route.table)
        .scope(match route.scope {
            RouteScope::Universe => KernelRouteScope::Universe,
            RouteScope::Link => KernelRouteScope::Link,
        });
    if let Some(gateway) = route.gateway {
        builder = builder.gateway(gateway);
    }
    if let Some(source) = route.source {
        builder = builder.pref_source(source);
    }
    if let Some(link) = route.link {
        builder = builder.output_interface(link.to_u32());
    }
    builder.build()
}

/// Deletes match on whatever is set; protocol, scope and type are left open.
fn route_deletion_message(route: &Route) -> RouteMessage {
    let mut message = route_message(route);
    message.header.protocol = RouteProtocol::Unspec;
    message.header.scope = KernelRouteScope::NoWhere;
    message.header.kind = RouteType::Unspec;
    message
}

fn rule_message(rule: &PolicyRule) -> RuleMessage {
    let mut message = RuleMessage::default();
    message.header.family = AddressFamily::Inet;
    message.header.action = RuleAction::ToTable;
    if rule.table != 0 {
        message.header.table = u8::try_from(rule.table).unwrap_or(0);
        message.attributes.push(RuleAttribute::Table(rule.table));
    }
    if let Some(source) = rule.source {
        message.header.src_len = source.prefix_len();
        message
            .attributes
            .push(RuleAttribute::Source(IpAddr::V4(source.network())));
    }
    if let Some(destination) = rule.destination {
        message.header.dst_len = destination.prefix_len();
        message
            .attributes
            .push(RuleAttribute::Destination(IpAddr::V4(destination.network())));
    }
    if let Some(priority) = rule.priority {
        message.attributes.push(RuleAttribute::Priority(priority));
    }
    if let Some(fwmark) = rule.fwmark {
        message.attributes.push(RuleAttribute::FwMark(fwmark.mark));
        message.attributes.push(RuleAttribute::FwMask(fwmark.mask));
    }
    if rule.invert {
        message.header.flags.insert(RuleFlags::Invert);
    }
    message
}

fn rule_from_message(message: &RuleMessage) -> Option<PolicyRule> {
    if message.header.family != AddressFamily::Inet {
        return None;
    }
    let mut rule = PolicyRule {
        table: u32::from(message.header.table),
        invert: message.header.flags.contains(RuleFlags::Invert),
        ..PolicyRule::default()
    };
    let mut mark = None;
    let mut mask = None;
    for attribute in &message.attributes {
        match attribute {
            RuleAttribute::Source(IpAddr::V4(addr)) => {
                rule.source = Ipv4Net::new(*addr, message.header.src_len).ok();
            }
            RuleAttribute::Destination(IpAddr::V4(addr)) => {
                rule.destination = Ipv4Net::new(*addr, message.header.dst_len).ok();
            }
            RuleAttribute::Table(table) => rule.table = *table,
            RuleAttribute::Priority(priority) => rule.priority = Some(*priority),
            RuleAttribute::FwMark(value) => mark = Some(*value),
            RuleAttribute::FwMask(value) => mask = Some(*value),
            _ => {}
        }
    }
    if let Some(mark) = mark {
        rule.fwmark = Some(crate::route::FwMark {
            mark,
            mask: mask.unwrap_or(u32::MAX),
        });
    }
    Some(rule)
}

impl NetLink for KernelNetLink {
    fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        let messages: Vec<LinkMessage> =
            self.run(self.handle.link().get().execute().try_collect())?;
        Ok(messages.into_iter().filter_map(link_from_message).collect())
    }

    fn link_by_index(&self, index: InterfaceIndex) -> Result<Link, NetlinkError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_index(index.to_u32())
            .execute();
        let message = self.run(links.try_next())?;
        message
            .and_then(link_from_message)
            .ok_or(NetlinkError::NotFound)
    }

    fn link_set_mtu(&self, link: &Link, mtu: Mtu) -> Result<(), NetlinkError> {
        let message = LinkUnspec::new_with_index(link.index.to_u32())
            .mtu(mtu.to_u32())
            .build();
        self.run(self.handle.link().set(message).execute())
    }

    fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError> {
        let message = LinkUnspec::new_with_index(link.index.to_u32()).up().build();
        self.run(self.handle.link().set(message).execute())
    }

    fn addr_list(&self, link: &Link) -> Result<Vec<Ipv4Net>, NetlinkError> {
        let messages: Vec<_> = self.run(
            self.handle
                .address()
                .get()
                .set_link_index_filter(link.index.to_u32())
                .execute()
                .try_collect(),
        )?;
        Ok(messages
            .iter()
            .filter(|message| message.header.family == AddressFamily::Inet)
            .filter_map(|message| {
                message.attributes.iter().find_map(|attribute| match attribute {
                    AddressAttribute::Address(IpAddr::V4(addr)) => {
                        Ipv4Net::new(*addr, message.header.prefix_len).ok()
                    }
                    _ => None,
                })
            })
            .collect())
    }

    fn addr_add(&self, link: &Link, address: Ipv4Net) -> Result<(), NetlinkError> {
        self.run(
            self.handle
                .address()
                .add(
                    link.index.to_u32(),
                    IpAddr::V4(address.addr()),
                    address.prefix_len(),
                )
                .execute(),
        )
    }

    fn route_add(&self, route: &Route) -> Result<(), NetlinkError> {
        self.run(self.handle.route().add(route_message(route)).execute())
    }

    fn route_del(&self, route: &Route) -> Result<(), NetlinkError> {
        self.run(
            self.handle
                .route()
                .del(route_deletion_message(route))
                .execute(),
        )
    }

    fn rule_add(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let mut request = self.handle.rule().add().v4();
        *request.message_mut() = rule_message(rule);
        self.run(request.execute())
    }

    fn rule_del(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.run(self.handle.rule().del(rule_message(rule)).execute())
    }

    fn rule_list(&self) -> Result<Vec<PolicyRule>, NetlinkError> {
        let messages: Vec<RuleMessage> =
            self.run(self.handle.rule().get(IpVersion::V4).execute().try_collect())?;
        Ok(messages.iter().filter_map(rule_from_message).collect())
    }
}
