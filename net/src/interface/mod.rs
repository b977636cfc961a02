// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Identifiers and properties of kernel network devices.

use std::fmt::{Display, Formatter};
use std::num::NonZero;

/// The kernel's index of a network device.
///
/// Index zero is never assigned to a device.
#[must_use]
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InterfaceIndex(NonZero<u32>);

/// Zero is not a legal [`InterfaceIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interface index zero is reserved")]
pub struct InvalidInterfaceIndex;

impl InterfaceIndex {
    /// Create a new [`InterfaceIndex`].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidInterfaceIndex`] if `index` is zero.
    pub fn try_new(index: u32) -> Result<Self, InvalidInterfaceIndex> {
        NonZero::new(index).map(Self).ok_or(InvalidInterfaceIndex)
    }

    /// The raw index as the kernel reports it.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        self.0.get()
    }
}

impl Display for InterfaceIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated network device name.
///
/// Linux limits device names to [`InterfaceName::MAX_LEN`] bytes (plus the null terminator)
/// and forbids `/` and whitespace.
/// Names additionally end up in `/proc/sys` paths, so `.` and `..` are rejected as well.
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct InterfaceName(String);

/// Errors which may occur when validating an [`InterfaceName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IllegalInterfaceName {
    /// Empty names are illegal
    #[error("interface name may not be empty")]
    Empty,
    /// The kernel will not accept names this long
    #[error("interface name '{0}' is longer than {max} bytes", max = InterfaceName::MAX_LEN)]
    TooLong(String),
    /// The name contains a character the kernel rejects
    #[error("interface name '{0}' contains illegal characters")]
    IllegalCharacters(String),
}

impl InterfaceName {
    /// The longest legal name (not counting the null terminator).
    pub const MAX_LEN: usize = 15;
}

impl TryFrom<String> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(IllegalInterfaceName::Empty);
        }
        if value.len() > InterfaceName::MAX_LEN {
            return Err(IllegalInterfaceName::TooLong(value));
        }
        if value == "."
            || value == ".."
            || !value
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '/' && c != ':')
        {
            return Err(IllegalInterfaceName::IllegalCharacters(value));
        }
        Ok(InterfaceName(value))
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        InterfaceName::try_from(value.to_string())
    }
}

impl From<InterfaceName> for String {
    fn from(value: InterfaceName) -> Self {
        value.0
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for InterfaceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maximum transmission unit of an ENI.
///
/// The VPC fabric supports jumbo frames up to [`Mtu::MAX`]; anything below [`Mtu::MIN`] is
/// below the IPv4 minimum datagram size every host must accept.
#[must_use]
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mtu(u32);

/// The requested MTU is outside of [`Mtu::MIN`]..=[`Mtu::MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mtu {0} is outside of {min}..={max}", min = Mtu::MIN.0, max = Mtu::MAX.0)]
pub struct InvalidMtu(pub u32);

impl Mtu {
    /// Smallest MTU we configure.
    pub const MIN: Mtu = Mtu(576);
    /// Largest MTU we configure (jumbo frames).
    pub const MAX: Mtu = Mtu(9001);
    /// MTU used when nothing else is requested.
    pub const DEFAULT: Mtu = Mtu::MAX;

    /// Clamp an arbitrary value into the legal range.
    pub fn clamped(value: u32) -> Mtu {
        Mtu(value.clamp(Mtu::MIN.0, Mtu::MAX.0))
    }

    /// The raw value.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        self.0
    }
}

impl Default for Mtu {
    fn default() -> Self {
        Mtu::DEFAULT
    }
}

impl TryFrom<u32> for Mtu {
    type Error = InvalidMtu;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if (Mtu::MIN.0..=Mtu::MAX.0).contains(&value) {
            Ok(Mtu(value))
        } else {
            Err(InvalidMtu(value))
        }
    }
}

impl Display for Mtu {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use crate::interface::{IllegalInterfaceName, InterfaceIndex, InterfaceName, InvalidMtu, Mtu};

    #[test]
    fn index_zero_is_reserved() {
        assert!(InterfaceIndex::try_new(0).is_err());
        assert_eq!(InterfaceIndex::try_new(7).unwrap().to_u32(), 7);
    }

    #[test]
    fn interface_names() {
        assert_eq!(InterfaceName::try_from("eth0").unwrap().as_ref(), "eth0");
        assert_eq!(InterfaceName::try_from(""), Err(IllegalInterfaceName::Empty));
        assert!(matches!(
            InterfaceName::try_from("a-very-long-interface"),
            Err(IllegalInterfaceName::TooLong(_))
        ));
        for bad in ["eth 0", "eth/0", "..", "eth:1"] {
            assert!(
                matches!(
                    InterfaceName::try_from(bad),
                    Err(IllegalInterfaceName::IllegalCharacters(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn mtu_clamping() {
        assert_eq!(Mtu::clamped(1), Mtu::MIN);
        assert_eq!(Mtu::clamped(1500).to_u32(), 1500);
        assert_eq!(Mtu::clamped(65536), Mtu::MAX);
        assert_eq!(Mtu::default().to_u32(), 9001);
    }

    #[test]
    fn mtu_validation() {
        assert_eq!(Mtu::try_from(9001), Ok(Mtu::MAX));
        assert_eq!(Mtu::try_from(9002), Err(InvalidMtu(9002)));
        assert_eq!(Mtu::try_from(575), Err(InvalidMtu(575)));
    }
}
