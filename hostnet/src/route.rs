// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Routing table entries and policy rules.

use ipnet::Ipv4Net;
use net::interface::InterfaceIndex;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// The kernel's main routing table.
pub const MAIN_TABLE: u32 = 254;
/// Priority of the host rules (legacy VPC rule and the primary ENI fwmark rule).
pub const MAIN_ENI_RULE_PRIORITY: u32 = 1024;
/// Priority of the rules steering pod traffic into per-ENI tables.
pub const FROM_POD_RULE_PRIORITY: u32 = 1536;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
}

/// An IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// `0.0.0.0/0` for a default route.
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    /// Preferred source address.
    pub source: Option<Ipv4Addr>,
    pub link: Option<InterfaceIndex>,
    pub table: u32,
    pub scope: RouteScope,
}

impl Route {
    /// A directly connected route to `destination` out of `link`.
    #[must_use]
    pub fn on_link(destination: Ipv4Net, link: InterfaceIndex, table: u32) -> Route {
        Route {
            destination: destination.trunc(),
            gateway: None,
            source: None,
            link: Some(link),
            table,
            scope: RouteScope::Link,
        }
    }

    /// A default route via `gateway` out of `link`.
    #[must_use]
    pub fn default_via(gateway: Ipv4Addr, link: InterfaceIndex, table: u32) -> Route {
        Route {
            destination: Ipv4Net::default(),
            gateway: Some(gateway),
            source: None,
            link: Some(link),
            table,
            scope: RouteScope::Universe,
        }
    }

    /// Matches whatever route currently occupies this destination in this table, whatever
    /// its device, gateway or preferred source.
    #[must_use]
    pub fn deletion_key(&self) -> Route {
        Route {
            gateway: None,
            source: None,
            link: None,
            ..self.clone()
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.destination.prefix_len() == 0 {
            write!(f, "default")?;
        } else {
            write!(f, "{}", self.destination)?;
        }
        if let Some(gateway) = self.gateway {
            write!(f, " via {gateway}")?;
        }
        if let Some(link) = self.link {
            write!(f, " dev {link}")?;
        }
        if let Some(source) = self.source {
            write!(f, " src {source}")?;
        }
        if self.scope == RouteScope::Link {
            write!(f, " scope link")?;
        }
        write!(f, " table {}", self.table)
    }
}

/// A firewall mark match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FwMark {
    pub mark: u32,
    pub mask: u32,
}

/// An IPv4 policy routing rule.
///
/// Unset fields match anything; a `table` of zero means no table was given.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    pub source: Option<Ipv4Net>,
    pub destination: Option<Ipv4Net>,
    pub table: u32,
    pub priority: Option<u32>,
    pub fwmark: Option<FwMark>,
    /// `not` in `ip rule` terms: the selector is negated.
    pub invert: bool,
}

impl PolicyRule {
    /// Returns true if every field set in `pattern` equals the corresponding field of `self`.
    ///
    /// This is how the kernel picks the rule a delete request refers to.
    #[must_use]
    pub fn matches(&self, pattern: &PolicyRule) -> bool {
        (pattern.source.is_none() || pattern.source == self.source)
            && (pattern.destination.is_none() || pattern.destination == self.destination)
            && (pattern.table == 0 || pattern.table == self.table)
            && (pattern.priority.is_none() || pattern.priority == self.priority)
            && (pattern.fwmark.is_none() || pattern.fwmark == self.fwmark)
            && pattern.invert == self.invert
    }
}

impl Display for PolicyRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(priority) = self.priority {
            write!(f, "{priority}: ")?;
        }
        if self.invert {
            write!(f, "not ")?;
        }
        match self.source {
            Some(source) => write!(f, "from {source}")?,
            None => write!(f, "from all")?,
        }
        if let Some(destination) = self.destination {
            write!(f, " to {destination}")?;
        }
        if let Some(FwMark { mark, mask }) = self.fwmark {
            write!(f, " fwmark {mark:#x}/{mask:#x}")?;
        }
        match self.table {
            0 => Ok(()),
            MAIN_TABLE => write!(f, " lookup main"),
            table => write!(f, " lookup {table}"),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::route::{FwMark, MAIN_TABLE, PolicyRule, Route};
    use net::interface::InterfaceIndex;
    use std::net::Ipv4Addr;

    #[test]
    fn route_display() {
        let link = InterfaceIndex::try_new(3).unwrap();
        let route = Route::default_via(Ipv4Addr::new(10, 10, 0, 1), link, 10);
        assert_eq!(route.to_string(), "default via 10.10.0.1 dev 3 table 10");
        let route = Route::on_link("10.10.10.20/16".parse().unwrap(), link, 10);
        assert_eq!(route.to_string(), "10.10.0.0/16 dev 3 scope link table 10");
        assert_eq!(route.deletion_key().to_string(), "10.10.0.0/16 scope link table 10");
    }

    #[test]
    fn rule_display() {
        let rule = PolicyRule {
            fwmark: Some(FwMark {
                mark: 0x80,
                mask: 0x80,
            }),
            table: MAIN_TABLE,
            priority: Some(1024),
            ..PolicyRule::default()
        };
        assert_eq!(rule.to_string(), "1024: from all fwmark 0x80/0x80 lookup main");
        let rule = PolicyRule {
            destination: Some("10.10.0.0/16".parse().unwrap()),
            invert: true,
            table: MAIN_TABLE,
            ..PolicyRule::default()
        };
        assert_eq!(rule.to_string(), "not from all to 10.10.0.0/16 lookup main");
    }

    #[test]
    fn unset_fields_are_wildcards() {
        let rule = PolicyRule {
            source: Some("10.10.10.20/32".parse().unwrap()),
            destination: Some("10.11.0.0/16".parse().unwrap()),
            table: 10,
            priority: Some(1536),
            ..PolicyRule::default()
        };
        let by_source = PolicyRule {
            source: rule.source,
            ..PolicyRule::default()
        };
        assert!(rule.matches(&by_source));
        assert!(rule.matches(&rule));
        let other_table = PolicyRule {
            table: 11,
            ..by_source.clone()
        };
        assert!(!rule.matches(&other_table));
        let inverted = PolicyRule {
            invert: true,
            ..by_source
        };
        assert!(!rule.matches(&inverted));
    }
}
