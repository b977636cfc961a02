// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// The IPv4 address space has no address after `255.255.255.255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no IPv4 address follows {0}")]
pub struct Ipv4Overflow(pub Ipv4Addr);

/// Returns the address following `addr`, treating the address as a big-endian integer.
///
/// # Errors
///
/// Returns [`Ipv4Overflow`] if `addr` is `255.255.255.255`.
pub fn next_address(addr: Ipv4Addr) -> Result<Ipv4Addr, Ipv4Overflow> {
    u32::from(addr)
        .checked_add(1)
        .map(Ipv4Addr::from)
        .ok_or(Ipv4Overflow(addr))
}

/// The first usable host address of a subnet (the network address plus one).
///
/// In a VPC subnet this is the address of the subnet router, which is what we use as the
/// gateway of the per-ENI default route.
///
/// # Errors
///
/// Returns [`Ipv4Overflow`] for `255.255.255.255/32`.
pub fn first_usable(subnet: &Ipv4Net) -> Result<Ipv4Addr, Ipv4Overflow> {
    next_address(subnet.network())
}

#[cfg(test)]
mod test {
    use crate::ipv4::{Ipv4Overflow, first_usable, next_address};
    use ipnet::Ipv4Net;
    use std::net::Ipv4Addr;

    #[test]
    fn increment() {
        assert_eq!(
            next_address(Ipv4Addr::new(10, 0, 0, 1)),
            Ok(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn carry_one_octet() {
        assert_eq!(
            next_address(Ipv4Addr::new(10, 0, 0, 255)),
            Ok(Ipv4Addr::new(10, 0, 1, 0))
        );
    }

    #[test]
    fn carry_two_octets() {
        assert_eq!(
            next_address(Ipv4Addr::new(10, 0, 255, 255)),
            Ok(Ipv4Addr::new(10, 1, 0, 0))
        );
    }

    #[test]
    fn overflow() {
        assert_eq!(
            next_address(Ipv4Addr::BROADCAST),
            Err(Ipv4Overflow(Ipv4Addr::BROADCAST))
        );
    }

    #[test]
    fn increment_is_integer_successor() {
        bolero::check!().with_type().cloned().for_each(|raw: u32| {
            let addr = Ipv4Addr::from(raw);
            match raw.checked_add(1) {
                Some(next) => assert_eq!(next_address(addr), Ok(Ipv4Addr::from(next))),
                None => assert!(next_address(addr).is_err()),
            }
        });
    }

    #[test]
    fn subnet_gateway() {
        let subnet: Ipv4Net = "10.10.0.0/16".parse().unwrap();
        assert_eq!(first_usable(&subnet), Ok(Ipv4Addr::new(10, 10, 0, 1)));
        // host bits in the subnet description do not move the gateway
        let subnet: Ipv4Net = "10.10.10.20/16".parse().unwrap();
        assert_eq!(first_usable(&subnet), Ok(Ipv4Addr::new(10, 10, 0, 1)));
    }
}
