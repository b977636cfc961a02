// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Firewall rules as argument vectors.

use std::fmt::{Display, Formatter};

/// A firewall rule as the argument list given to `iptables -A <chain>`.
///
/// Two rules are equal when their arguments are equal, element for element.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    #[must_use]
    pub fn new(args: Vec<String>) -> RuleSpec {
        RuleSpec(args)
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// The `-j` target of the rule, if any.
    #[must_use]
    pub fn jump_target(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|pair| pair[0] == "-j")
            .map(|pair| pair[1].as_str())
    }

    /// The value of `--comment`, if any.
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|pair| pair[0] == "--comment")
            .map(|pair| pair[1].as_str())
    }

    /// Parse one line of `iptables -S <chain>` output.
    ///
    /// Only `-A <chain> ...` lines describe rules; policy and chain declarations yield `None`.
    #[must_use]
    pub fn from_listing(chain: &str, line: &str) -> Option<RuleSpec> {
        let mut words = split_quoted(line);
        if words.len() < 2 || words[0] != "-A" || words[1] != chain {
            return None;
        }
        Some(RuleSpec(words.split_off(2)))
    }
}

impl<S: Into<String>> FromIterator<S> for RuleSpec {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        RuleSpec(iter.into_iter().map(Into::into).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RuleSpec {
    fn from(value: [&str; N]) -> Self {
        value.into_iter().collect()
    }
}

/// Quotes arguments containing whitespace so the result survives a shell-style split.
impl Display for RuleSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let needs_quotes = arg.is_empty()
                || arg
                    .chars()
                    .any(|c| c.is_whitespace() || c == '"' || c == '\\');
            if needs_quotes {
                f.write_str("\"")?;
                for c in arg.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Split on whitespace, keeping double quoted runs together.
fn split_quoted(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
