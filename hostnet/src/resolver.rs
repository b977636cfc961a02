// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Find a network device by hardware address.
//!
//! A freshly attached ENI shows up in the link table some time after the cloud API reports
//! the attachment, so lookups poll.

use crate::backend::{Link, NetLink};
use crate::errors::NetworkError;
use net::eth::mac::Mac;
use std::time::Duration;
use tracing::{debug, warn};

/// Poll the link table until a device with `mac` appears.
///
/// The table is listed at most `attempts` times (at least once), sleeping `interval` between
/// attempts.
/// Nothing is modified.
///
/// # Errors
///
/// [`NetworkError::InterfaceNotFound`] once every attempt is used up.
/// Its source is the last listing error if no listing succeeded at all.
#[tracing::instrument(level = "debug", skip(netlink))]
pub fn resolve_link_by_mac<N: NetLink + ?Sized>(
    netlink: &N,
    mac: Mac,
    attempts: u32,
    interval: Duration,
) -> Result<Link, NetworkError> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    let mut every_listing_failed = true;
    for attempt in 1..=attempts {
        match netlink.link_list() {
            Ok(links) => {
                every_listing_failed = false;
                if let Some(link) = links.into_iter().find(|link| link.mac == Some(mac)) {
                    debug!("found {link} with mac {mac} on attempt {attempt}");
                    return Ok(link);
                }
                debug!("no link with mac {mac} yet (attempt {attempt}/{attempts})");
            }
            Err(err) => {
                warn!("failed to list links (attempt {attempt}/{attempts}): {err}");
                last_error = Some(err);
            }
        }
        if attempt < attempts && !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
    Err(NetworkError::InterfaceNotFound {
        mac,
        attempts,
        source: if every_listing_failed { last_error } else { None },
    })
}

#[cfg(test)]
mod test {
    use crate::backend::NetlinkError;
    use crate::errors::NetworkError;
    use crate::resolver::resolve_link_by_mac;
    use crate::testing::{MemNetLink, NetlinkCall, TEST_MAC1, TEST_MAC2, link, loopback};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn found_on_second_poll() {
        let netlink = MemNetLink::new();
        netlink.script_link_list(Ok(vec![loopback()]));
        netlink.script_link_list(Ok(vec![loopback(), link(2, "eth1", TEST_MAC2)]));
        let found = resolve_link_by_mac(&netlink, TEST_MAC2.parse().unwrap(), 5, Duration::ZERO)
            .unwrap();
        assert_eq!(found.name.as_ref(), "eth1");
        assert_eq!(netlink.calls(), vec![NetlinkCall::LinkList, NetlinkCall::LinkList]);
    }

    #[test]
    fn found_on_last_allowed_poll() {
        let netlink = MemNetLink::new();
        for _ in 0..4 {
            netlink.script_link_list(Ok(vec![loopback()]));
        }
        netlink.script_link_list(Ok(vec![loopback(), link(2, "eth1", TEST_MAC2)]));
        assert!(resolve_link_by_mac(&netlink, TEST_MAC2.parse().unwrap(), 5, Duration::ZERO).is_ok());
    }

    #[test]
    #[traced_test]
    fn absent_on_every_poll() {
        let netlink = MemNetLink::with_links(vec![loopback(), link(2, "eth0", TEST_MAC1)]);
        let err = resolve_link_by_mac(&netlink, TEST_MAC2.parse().unwrap(), 5, Duration::ZERO)
            .unwrap_err();
        match err {
            NetworkError::InterfaceNotFound {
                mac,
                attempts,
                source,
            } => {
                assert_eq!(mac.to_string(), TEST_MAC2);
                assert_eq!(attempts, 5);
                assert_eq!(source, None);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(netlink.calls().len(), 5);
        assert!(netlink.mutations().is_empty());
        assert!(logs_contain("no link with mac 01:23:45:67:89:a1 yet"));
    }

    #[test]
    fn listing_error_surfaces_when_every_listing_failed() {
        let netlink = MemNetLink::new();
        for i in 0..3 {
            netlink.script_link_list(Err(NetlinkError::Other(format!("dump interrupted {i}"))));
        }
        let err = resolve_link_by_mac(&netlink, TEST_MAC2.parse().unwrap(), 3, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::InterfaceNotFound {
                source: Some(NetlinkError::Other(ref reason)),
                ..
            } if reason == "dump interrupted 2"
        ));
    }

    #[test]
    fn listing_error_hidden_when_a_listing_succeeded() {
        let netlink = MemNetLink::new();
        netlink.script_link_list(Err(NetlinkError::Other("dump interrupted".into())));
        netlink.script_link_list(Ok(vec![loopback()]));
        let err = resolve_link_by_mac(&netlink, TEST_MAC2.parse().unwrap(), 2, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::InterfaceNotFound { source: None, .. }
        ));
    }

    #[test]
    fn zero_attempts_still_polls_once() {
        let netlink = MemNetLink::with_links(vec![link(2, "eth1", TEST_MAC2)]);
        assert!(resolve_link_by_mac(&netlink, TEST_MAC2.parse().unwrap(), 0, Duration::ZERO).is_ok());
    }
}
