// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Mac address type and logic.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A [MAC Address] type.
///
/// `Mac` is a transparent wrapper around `[u8; 6]` which provides a
/// small collection of methods and type safety.
///
/// [MAC Address]: https://en.wikipedia.org/wiki/MAC_address
#[must_use]
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
pub struct Mac(pub [u8; 6]);

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl From<Mac> for [u8; 6] {
    fn from(value: Mac) -> Self {
        value.0
    }
}

impl AsRef<[u8; 6]> for Mac {
    #[must_use]
    fn as_ref(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Mac {
    /// The zero `Mac`.
    ///
    /// `ZERO` is illegal as a source or destination `Mac` in most contexts.
    pub const ZERO: Mac = Mac([0; 6]);

    /// Returns true iff the binary representation of the [`Mac`] is exclusively zeros.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self == &Mac::ZERO
    }
}

/// Errors which can occur while interpreting bytes or text as a [`Mac`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacParseError {
    /// The input did not contain exactly six octets.
    #[error("expected 6 octets in mac address, found {0}")]
    WrongLength(usize),
    /// One of the octets was not a two digit hex number.
    #[error("invalid octet '{0}' in mac address")]
    InvalidOctet(String),
}

impl TryFrom<&[u8]> for Mac {
    type Error = MacParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let octets: [u8; 6] = value
            .try_into()
            .map_err(|_| MacParseError::WrongLength(value.len()))?;
        Ok(Mac(octets))
    }
}

impl FromStr for Mac {
    type Err = MacParseError;

    /// Parses the colon separated notation the kernel reports, e.g. `01:23:45:67:89:ab`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.trim().split(':') {
            if count == octets.len() {
                return Err(MacParseError::WrongLength(count + 1));
            }
            if part.len() != 2 {
                return Err(MacParseError::InvalidOctet(part.to_string()));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::InvalidOctet(part.to_string()))?;
            count += 1;
        }
        if count != octets.len() {
            return Err(MacParseError::WrongLength(count));
        }
        Ok(Mac(octets))
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}
