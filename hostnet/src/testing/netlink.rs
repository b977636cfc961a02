// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{Link, NetLink, NetlinkError};
use crate::route::{PolicyRule, Route};
use ipnet::Ipv4Net;
use net::interface::{InterfaceIndex, Mtu};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// The [`NetLink`] operations, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    LinkList,
    LinkByIndex,
    LinkSetMtu,
    LinkSetUp,
    AddrList,
    AddrAdd,
    RouteAdd,
    RouteDel,
    RuleAdd,
    RuleDel,
    RuleList,
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkCall {
    LinkList,
    LinkByIndex(InterfaceIndex),
    LinkSetMtu(InterfaceIndex, Mtu),
    LinkSetUp(InterfaceIndex),
    AddrList(InterfaceIndex),
    AddrAdd(InterfaceIndex, Ipv4Net),
    RouteAdd(Route),
    RouteDel(Route),
    RuleAdd(PolicyRule),
    RuleDel(PolicyRule),
    RuleList,
}

impl NetlinkCall {
    pub fn op(&self) -> Op {
        match self {
            NetlinkCall::LinkList => Op::LinkList,
            NetlinkCall::LinkByIndex(_) => Op::LinkByIndex,
            NetlinkCall::LinkSetMtu(..) => Op::LinkSetMtu,
            NetlinkCall::LinkSetUp(_) => Op::LinkSetUp,
            NetlinkCall::AddrList(_) => Op::AddrList,
            NetlinkCall::AddrAdd(..) => Op::AddrAdd,
            NetlinkCall::RouteAdd(_) => Op::RouteAdd,
            NetlinkCall::RouteDel(_) => Op::RouteDel,
            NetlinkCall::RuleAdd(_) => Op::RuleAdd,
            NetlinkCall::RuleDel(_) => Op::RuleDel,
            NetlinkCall::RuleList => Op::RuleList,
        }
    }

    /// Whether the request changes kernel state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self.op(),
            Op::LinkList | Op::LinkByIndex | Op::AddrList | Op::RuleList
        )
    }
}

#[derive(Debug, Default)]
struct State {
    links: Vec<Link>,
    scripted: VecDeque<Result<Vec<Link>, NetlinkError>>,
    addresses: BTreeMap<InterfaceIndex, Vec<Ipv4Net>>,
    routes: Vec<Route>,
    rules: Vec<PolicyRule>,
    failures: HashMap<Op, VecDeque<NetlinkError>>,
    calls: Vec<NetlinkCall>,
}

impl State {
    fn record(&mut self, call: NetlinkCall) -> Result<(), NetlinkError> {
        let op = call.op();
        self.calls.push(call);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn link_mut(&mut self, index: InterfaceIndex) -> Result<&mut Link, NetlinkError> {
        self.links
            .iter_mut()
            .find(|link| link.index == index)
            .ok_or(NetlinkError::NotFound)
    }
}

/// Stateful netlink double.
///
/// Link listings come from the script queue while it is not empty, then from the link
/// table. Routes are keyed by table and destination, deletes treat unset fields as
/// wildcards the way the kernel does.
#[derive(Debug, Default)]
pub struct MemNetLink {
    state: Mutex<State>,
}

impl MemNetLink {
    pub fn new() -> MemNetLink {
        MemNetLink::default()
    }

    pub fn with_links(links: Vec<Link>) -> MemNetLink {
        let netlink = MemNetLink::new();
        netlink.state.lock().links = links;
        netlink
    }

    /// Queue the result of one future [`NetLink::link_list`] call.
    pub fn script_link_list(&self, result: Result<Vec<Link>, NetlinkError>) {
        self.state.lock().scripted.push_back(result);
    }

    pub fn add_link(&self, link: Link) {
        self.state.lock().links.push(link);
    }

    /// Make the next call of `op` fail with `err`; repeated calls queue up.
    pub fn fail(&self, op: Op, err: NetlinkError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<NetlinkCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn mutations(&self) -> Vec<NetlinkCall> {
        self.calls()
            .into_iter()
            .filter(NetlinkCall::is_mutation)
            .collect()
    }

    pub fn link_state(&self, index: InterfaceIndex) -> Option<Link> {
        self.state
            .lock()
            .links
            .iter()
            .find(|link| link.index == index)
            .cloned()
    }

    pub fn addresses(&self, index: InterfaceIndex) -> Vec<Ipv4Net> {
        self.state
            .lock()
            .addresses
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert_address(&self, index: InterfaceIndex, address: Ipv4Net) {
        self.state
            .lock()
            .addresses
            .entry(index)
            .or_default()
            .push(address);
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.clone()
    }

    pub fn routes_in(&self, table: u32) -> Vec<Route> {
        self.routes()
            .into_iter()
            .filter(|route| route.table == table)
            .collect()
    }

    pub fn insert_route(&self, route: Route) {
        self.state.lock().routes.push(route);
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.state.lock().rules.clone()
    }

    pub fn insert_rule(&self, rule: PolicyRule) {
        self.state.lock().rules.push(rule);
    }
}

fn route_matches(route: &Route, pattern: &Route) -> bool {
    route.destination == pattern.destination
        && route.table == pattern.table
        && (pattern.link.is_none() || pattern.link == route.link)
        && (pattern.gateway.is_none() || pattern.gateway == route.gateway)
        && (pattern.source.is_none() || pattern.source == route.source)
}

impl NetLink for MemNetLink {
    fn link_list(&self) -> Result<Vec<Link>, NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::LinkList)?;
        match state.scripted.pop_front() {
            Some(result) => result,
            None => Ok(state.links.clone()),
        }
    }

    fn link_by_index(&self, index: InterfaceIndex) -> Result<Link, NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::LinkByIndex(index))?;
        state.link_mut(index).cloned()
    }

    fn link_set_mtu(&self, link: &Link, mtu: Mtu) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::LinkSetMtu(link.index, mtu))?;
        state.link_mut(link.index)?.mtu = mtu.to_u32();
        Ok(())
    }

    fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::LinkSetUp(link.index))?;
        state.link_mut(link.index)?.up = true;
        Ok(())
    }

    fn addr_list(&self, link: &Link) -> Result<Vec<Ipv4Net>, NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::AddrList(link.index))?;
        Ok(state
            .addresses
            .get(&link.index)
            .cloned()
            .unwrap_or_default())
    }

    fn addr_add(&self, link: &Link, address: Ipv4Net) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::AddrAdd(link.index, address))?;
        let assigned = state.addresses.entry(link.index).or_default();
        if assigned.contains(&address) {
            return Err(NetlinkError::Exists);
        }
        assigned.push(address);
        Ok(())
    }

    fn route_add(&self, route: &Route) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::RouteAdd(route.clone()))?;
        if state
            .routes
            .iter()
            .any(|r| r.table == route.table && r.destination == route.destination)
        {
            return Err(NetlinkError::Exists);
        }
        state.routes.push(route.clone());
        Ok(())
    }

    fn route_del(&self, route: &Route) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::RouteDel(route.clone()))?;
        let position = state
            .routes
            .iter()
            .position(|r| route_matches(r, route))
            .ok_or(NetlinkError::NotFound)?;
        state.routes.remove(position);
        Ok(())
    }

    fn rule_add(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::RuleAdd(rule.clone()))?;
        if state.rules.contains(rule) {
            return Err(NetlinkError::Exists);
        }
        state.rules.push(rule.clone());
        Ok(())
    }

    fn rule_del(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::RuleDel(rule.clone()))?;
        let position = state
            .rules
            .iter()
            .position(|r| r.matches(rule))
            .ok_or(NetlinkError::NotFound)?;
        state.rules.remove(position);
        Ok(())
    }

    fn rule_list(&self) -> Result<Vec<PolicyRule>, NetlinkError> {
        let mut state = self.state.lock();
        state.record(NetlinkCall::RuleList)?;
        Ok(state.rules.clone())
    }
}
