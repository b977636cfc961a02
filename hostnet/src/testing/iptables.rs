// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::backend::{Iptables, IptablesError};
use crate::rulespec::RuleSpec;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

const TERMINAL_TARGETS: [&str; 10] = [
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "LOG",
    "SNAT",
    "DNAT",
    "MASQUERADE",
    "CONNMARK",
    "MARK",
];

/// Mutations applied so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IptablesCounters {
    pub appended: usize,
    pub deleted: usize,
    pub chains_created: usize,
    pub chains_cleared: usize,
    pub chains_deleted: usize,
}

#[derive(Debug, Default)]
struct Chain {
    builtin: bool,
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<String, Chain>>,
    counters: IptablesCounters,
    failing: HashSet<&'static str>,
}

impl State {
    fn check(&self, operation: &'static str, table: &str, chain: &str) -> Result<(), IptablesError> {
        if self.failing.contains(operation) {
            return Err(IptablesError::new(operation, table, chain, "injected failure"));
        }
        Ok(())
    }

    fn chain(
        &mut self,
        operation: &'static str,
        table: &str,
        chain: &str,
    ) -> Result<&mut Chain, IptablesError> {
        self.check(operation, table, chain)?;
        self.tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
            .ok_or_else(|| IptablesError::new(operation, table, chain, "No chain/target/match by that name."))
    }

    fn is_referenced(&self, table: &str, chain: &str) -> bool {
        self.tables.get(table).is_some_and(|chains| {
            chains
                .values()
                .flat_map(|c| c.rules.iter())
                .any(|rule| rule.jump_target() == Some(chain))
        })
    }
}

/// Stateful iptables double holding the `nat` and `mangle` tables.
///
/// Appends refuse jumps to chains which do not exist, and chain deletion refuses chains
/// which are built in, not empty or still referenced, so ordering mistakes surface as errors.
#[derive(Debug)]
pub struct MemIptables {
    state: Mutex<State>,
    random_fully: bool,
}

impl Default for MemIptables {
    fn default() -> Self {
        MemIptables::new()
    }
}

impl MemIptables {
    pub fn new() -> MemIptables {
        let mut tables = BTreeMap::new();
        for (table, chains) in [
            ("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"][..]),
            (
                "mangle",
                &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"][..],
            ),
        ] {
            let chains: BTreeMap<String, Chain> = chains
                .iter()
                .map(|name| {
                    (
                        (*name).to_string(),
                        Chain {
                            builtin: true,
                            rules: Vec::new(),
                        },
                    )
                })
                .collect();
            tables.insert(table.to_string(), chains);
        }
        MemIptables {
            state: Mutex::new(State {
                tables,
                ..State::default()
            }),
            random_fully: true,
        }
    }

    #[must_use]
    pub fn with_random_fully(self, supported: bool) -> MemIptables {
        MemIptables {
            random_fully: supported,
            ..self
        }
    }

    /// Make every later call of `operation` (e.g. `"append"`) fail.
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().failing.insert(operation);
    }

    /// Create a user chain, bypassing the counters.
    pub fn seed_chain(&self, table: &str, chain: &str) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default();
    }

    /// Append a rule, creating the chain if needed and bypassing every check.
    pub fn seed_rule(&self, table: &str, chain: &str, rule: impl Into<RuleSpec>) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default()
            .rules
            .push(rule.into());
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<RuleSpec> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .tables
            .get(table)
            .is_some_and(|chains| chains.contains_key(chain))
    }

    /// Names of the user defined chains of `table`.
    pub fn user_chains(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|chains| {
                chains
                    .iter()
                    .filter(|(_, c)| !c.builtin)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn counters(&self) -> IptablesCounters {
        self.state.lock().counters
    }

    pub fn reset_counters(&self) {
        self.state.lock().counters = IptablesCounters::default();
    }
}

impl Iptables for MemIptables {
    fn exists(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<bool, IptablesError> {
        let state = self.state.lock();
        state.check("exists", table, chain)?;
        Ok(state
            .tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .is_some_and(|c| c.rules.contains(rule)))
    }

    fn append(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), IptablesError> {
        let mut state = self.state.lock();
        if let Some(target) = rule.jump_target() {
            let known = TERMINAL_TARGETS.contains(&target)
                || state
                    .tables
                    .get(table)
                    .is_some_and(|chains| chains.contains_key(target));
            if !known {
                return Err(IptablesError::new(
                    "append",
                    table,
                    chain,
                    format!("Couldn't load target `{target}'"),
                ));
            }
        }
        state.chain("append", table, chain)?.rules.push(rule.clone());
        state.counters.appended += 1;
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), IptablesError> {
        let mut state = self.state.lock();
        let rules = &mut state.chain("delete", table, chain)?.rules;
        let position = rules.iter().position(|r| r == rule).ok_or_else(|| {
            IptablesError::new(
                "delete",
                table,
                chain,
                "Bad rule (does a matching rule exist in that chain?).",
            )
        })?;
        rules.remove(position);
        state.counters.deleted += 1;
        Ok(())
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock();
        state.check("new_chain", table, chain)?;
        let chains = state.tables.entry(table.to_string()).or_default();
        if chains.contains_key(chain) {
            return Err(IptablesError::new(
                "new_chain",
                table,
                chain,
                "Chain already exists.",
            ));
        }
        chains.insert(chain.to_string(), Chain::default());
        state.counters.chains_created += 1;
        Ok(())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock();
        state.chain("clear_chain", table, chain)?.rules.clear();
        state.counters.chains_cleared += 1;
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock();
        let target = state.chain("delete_chain", table, chain)?;
        let refusal = if target.builtin {
            Some("Can't delete built-in chain.")
        } else if !target.rules.is_empty() {
            Some("Directory not empty.")
        } else if state.is_referenced(table, chain) {
            Some("Too many links.")
        } else {
            None
        };
        if let Some(reason) = refusal {
            return Err(IptablesError::new("delete_chain", table, chain, reason));
        }
        if let Some(chains) = state.tables.get_mut(table) {
            chains.remove(chain);
        }
        state.counters.chains_deleted += 1;
        Ok(())
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError> {
        let state = self.state.lock();
        state.check("list_chains", table, "")?;
        state
            .tables
            .get(table)
            .map(|chains| chains.keys().cloned().collect())
            .ok_or_else(|| IptablesError::new("list_chains", table, "", "Table does not exist."))
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        let mut state = self.state.lock();
        let c = state.chain("list", table, chain)?;
        let header = if c.builtin {
            format!("-P {chain} ACCEPT")
        } else {
            format!("-N {chain}")
        };
        Ok(std::iter::once(header)
            .chain(c.rules.iter().map(|rule| format!("-A {chain} {rule}")))
            .collect())
    }

    fn has_random_fully(&self) -> bool {
        self.random_fully
    }
}

#[cfg(test)]
mod test {
    use crate::backend::Iptables;
    use crate::rulespec::RuleSpec;
    use crate::testing::MemIptables;

    #[test]
    fn jump_to_missing_chain_is_refused() {
        let iptables = MemIptables::new();
        let jump = RuleSpec::from(["-j", "AWS-SNAT-CHAIN-0"]);
        assert!(iptables.append("nat", "POSTROUTING", &jump).is_err());
        iptables.new_chain("nat", "AWS-SNAT-CHAIN-0").unwrap();
        iptables.append("nat", "POSTROUTING", &jump).unwrap();
        assert!(iptables.delete_chain("nat", "AWS-SNAT-CHAIN-0").is_err());
        iptables.delete("nat", "POSTROUTING", &jump).unwrap();
        iptables.delete_chain("nat", "AWS-SNAT-CHAIN-0").unwrap();
        assert!(!iptables.has_chain("nat", "AWS-SNAT-CHAIN-0"));
    }

    #[test]
    fn listing_round_trips_through_rulespec() {
        let iptables = MemIptables::new();
        let rule = RuleSpec::from(["-m", "comment", "--comment", "AWS, SNAT", "-j", "ACCEPT"]);
        iptables.append("nat", "POSTROUTING", &rule).unwrap();
        let lines = iptables.list("nat", "POSTROUTING").unwrap();
        assert_eq!(lines[0], "-P POSTROUTING ACCEPT");
        assert_eq!(RuleSpec::from_listing("POSTROUTING", &lines[1]), Some(rule));
    }
}
