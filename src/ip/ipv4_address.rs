use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// An IPv4 address as seen by the TCP layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The wildcard address `0.0.0.0`. A PCB bound to it accepts traffic for
    /// any local address and takes its real address from the outgoing
    /// interface on first transmit.
    pub const ANY: Self = Self([0u8, 0, 0, 0]);

    /// The address `127.0.0.1`.
    pub const LOCALHOST: Self = Self([127u8, 0, 0, 1]);

    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    /// Whether this is the wildcard address.
    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// Gets the address as a `u32`.
    pub fn to_u32(self) -> u32 {
        self.into()
    }

    /// Gets the address as a `[u8; 4]`.
    pub fn to_bytes(self) -> [u8; 4] {
        self.into()
    }

    /// Whether `self` and `other` fall in the same network under `netmask`.
    pub fn same_network(self, other: Self, netmask: Self) -> bool {
        self.to_u32() & netmask.to_u32() == other.to_u32() & netmask.to_u32()
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self::from(n.to_be_bytes())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        u32::from_be_bytes(address.0)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

impl From<std::net::Ipv4Addr> for Ipv4Address {
    fn from(address: std::net::Ipv4Addr) -> Self {
        Self(address.octets())
    }
}
