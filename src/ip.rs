//! The contract TCP relies on from the IP layer beneath it.
//!
//! TCP never touches link addresses or routing tables. It asks the IP layer
//! which interface a destination goes out of, and hands finished segments to
//! it together with the addresses, TTL and protocol number. Whatever happens
//! afterwards (address resolution, framing, queueing on a device) is opaque,
//! except that a buffer still waiting somewhere below keeps its reference
//! count raised.

use crate::buffer::Pbuf;
use thiserror::Error as ThisError;

mod ipv4_address;
pub use ipv4_address::Ipv4Address;

mod tx_queue;
pub use tx_queue::{Datagram, TxQueue};

/// The IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

/// The interface a datagram is sent through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Netif {
    /// A name for diagnostics, such as `eth0`.
    pub name: String,
    /// The interface's own address.
    pub address: Ipv4Address,
    /// The mask for the directly attached network.
    pub netmask: Ipv4Address,
    /// Hardware capabilities
    pub flags: NetifFlags,
}

impl Netif {
    pub fn new(name: impl Into<String>, address: Ipv4Address, netmask: Ipv4Address) -> Self {
        Self {
            name: name.into(),
            address,
            netmask,
            flags: NetifFlags::default(),
        }
    }

    /// Marks the interface as computing TCP checksums in hardware.
    pub fn with_tx_checksum_offload(mut self) -> Self {
        self.flags.set_tcp_tx_checksum_offload(true);
        self
    }
}

/// Capability bits of a network interface.
#[derive(Debug, Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct NetifFlags(u8);

impl NetifFlags {
    const TCP_TX_CHECKSUM_OFFLOAD: u8 = 0x01;

    /// Whether outgoing TCP checksums are filled in by the device.
    pub const fn tcp_tx_checksum_offload(self) -> bool {
        self.0 & Self::TCP_TX_CHECKSUM_OFFLOAD != 0
    }

    pub fn set_tcp_tx_checksum_offload(&mut self, state: bool) {
        if state {
            self.0 |= Self::TCP_TX_CHECKSUM_OFFLOAD;
        } else {
            self.0 &= !Self::TCP_TX_CHECKSUM_OFFLOAD;
        }
    }
}

/// The output half of an IP implementation.
///
/// Calls never block. Output either completes synchronously or fails; on
/// failure the implementation drops its reference to the buffer.
pub trait IpLayer: Send {
    /// Picks the interface that datagrams for `dst` leave through.
    fn route(&self, dst: Ipv4Address) -> Option<Netif>;

    /// Sends a transport-layer packet out of `netif`.
    fn output_if(
        &mut self,
        packet: Pbuf,
        src: Ipv4Address,
        dst: Ipv4Address,
        ttl: u8,
        protocol: u8,
        netif: &Netif,
    ) -> Result<(), IpError>;
}

/// An error reported by [`IpLayer::output_if`].
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum IpError {
    #[error("No route to {0}")]
    NoRoute(Ipv4Address),
    #[error("Could not allocate a buffer for the IP header")]
    Buffer,
    #[error("The link refused the datagram")]
    Link,
}
