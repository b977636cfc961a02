// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{Iptables, IptablesError};
use crate::rulespec::RuleSpec;
use std::process::Command;
use tracing::{debug, warn};

/// First iptables release whose SNAT target accepts `--random-fully`.
const RANDOM_FULLY_SINCE: (u32, u32, u32) = (1, 6, 2);

/// [`Iptables`] through the `iptables` command (IPv4).
pub struct KernelIptables {
    inner: iptables::IPTables,
    random_fully: bool,
}

impl std::fmt::Debug for KernelIptables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelIptables")
            .field("random_fully", &self.random_fully)
            .finish_non_exhaustive()
    }
}

/// Parse `iptables v1.8.7 (nf_tables)` style version banners.
fn parse_version(banner: &str) -> Option<(u32, u32, u32)> {
    let version = banner
        .split_whitespace()
        .find_map(|word| word.strip_prefix('v'))?;
    let mut parts = version.split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>()
    });
    let major = parts.next()?.ok()?;
    let minor = parts.next()?.ok()?;
    let patch = parts.next().and_then(Result::ok).unwrap_or(0);
    Some((major, minor, patch))
}

fn detect_random_fully() -> bool {
    let output = match Command::new("iptables").arg("--version").output() {
        Ok(output) => output,
        Err(e) => {
            warn!("unable to run iptables --version: {e}");
            return false;
        }
    };
    let banner = String::from_utf8_lossy(&output.stdout);
    match parse_version(&banner) {
        Some(version) => {
            debug!("iptables version {version:?}");
            version >= RANDOM_FULLY_SINCE
        }
        None => {
            warn!("unrecognized iptables version banner: {}", banner.trim());
            false
        }
    }
}

impl KernelIptables {
    /// # Errors
    ///
    /// Returns an [`IptablesError`] if the `iptables` command is unusable.
    pub fn new() -> Result<KernelIptables, IptablesError> {
        let inner = iptables::new(false).map_err(|e| IptablesError::new("init", "", "", e))?;
        Ok(KernelIptables {
            inner,
            random_fully: detect_random_fully(),
        })
    }
}

impl Iptables for KernelIptables {
    fn exists(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<bool, IptablesError> {
        self.inner
            .exists(table, chain, &rule.to_string())
            .map_err(|e| IptablesError::new("exists", table, chain, e))
    }

    fn append(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), IptablesError> {
        self.inner
            .append(table, chain, &rule.to_string())
            .map_err(|e| IptablesError::new("append", table, chain, e))
    }

    fn delete(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), IptablesError> {
        self.inner
            .delete(table, chain, &rule.to_string())
            .map_err(|e| IptablesError::new("delete", table, chain, e))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.inner
            .new_chain(table, chain)
            .map_err(|e| IptablesError::new("new_chain", table, chain, e))
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.inner
            .flush_chain(table, chain)
            .map_err(|e| IptablesError::new("clear_chain", table, chain, e))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.inner
            .delete_chain(table, chain)
            .map_err(|e| IptablesError::new("delete_chain", table, chain, e))
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError> {
        self.inner
            .list_chains(table)
            .map_err(|e| IptablesError::new("list_chains", table, "", e))
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        self.inner
            .list(table, chain)
            .map_err(|e| IptablesError::new("list", table, chain, e))
    }

    fn has_random_fully(&self) -> bool {
        self.random_fully
    }
}

#[cfg(test)]
mod test {
    use crate::kernel::iptables::{RANDOM_FULLY_SINCE, parse_version};

    #[test]
    fn version_banners() {
        assert_eq!(parse_version("iptables v1.8.7 (nf_tables)\n"), Some((1, 8, 7)));
        assert_eq!(parse_version("iptables v1.6.1"), Some((1, 6, 1)));
        assert_eq!(parse_version("iptables v1.4"), Some((1, 4, 0)));
        assert_eq!(parse_version("iptables"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn random_fully_threshold() {
        assert!(parse_version("iptables v1.6.2").unwrap() >= RANDOM_FULLY_SINCE);
        assert!(parse_version("iptables v1.8.4 (legacy)").unwrap() >= RANDOM_FULLY_SINCE);
        assert!(parse_version("iptables v1.6.1").unwrap() < RANDOM_FULLY_SINCE);
    }
}
