//! IPv4 subnets in CIDR notation.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use skiff_common::{SkiffError, SkiffResult};

/// Shortest prefix accepted; larger blocks make the allocation bitmap unreasonably big.
pub const MIN_PREFIX: u8 = 8;

/// Longest prefix accepted; /31 and /32 leave no room for a gateway plus hosts.
pub const MAX_PREFIX: u8 = 30;

/// An IPv4 network, always stored with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Build a subnet from any address inside it and a prefix length.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidSubnet`] when the prefix is outside
    /// [`MIN_PREFIX`]..=[`MAX_PREFIX`].
    pub fn new(addr: Ipv4Addr, prefix: u8) -> SkiffResult<Self> {
        if !(MIN_PREFIX..=MAX_PREFIX).contains(&prefix) {
            return Err(SkiffError::InvalidSubnet {
                value: format!("{addr}/{prefix}"),
            });
        }
        let mask = mask(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// Network (base) address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block, `2^(32 - prefix)`.
    #[must_use]
    pub const fn size(&self) -> usize {
        1usize << (32 - self.prefix as u32)
    }

    /// Whether `ip` lies inside the block.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }

    /// Address at `offset` from the network address.
    #[must_use]
    pub fn nth(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network).wrapping_add(offset))
    }

    /// Offset of `ip` from the network address, if it is inside the block.
    #[must_use]
    pub fn offset_of(&self, ip: Ipv4Addr) -> Option<u32> {
        self.contains(ip)
            .then(|| u32::from(ip) - u32::from(self.network))
    }
}

const fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SkiffError::InvalidSubnet {
            value: s.to_string(),
        };

        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
