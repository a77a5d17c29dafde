//! Contains utilities shared by the protocol modules.

use crate::ip::Ipv4Address;

/// A calculator for the Internet checksum used by TCP and its pseudo header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum {
    sum: u16,
    /// A byte left over from an odd-length run, waiting for its partner.
    pending: Option<u8>,
}

impl Checksum {
    /// Creates a new checksum calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `u16` to the checksum value.
    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.sum.overflowing_add(value);
        self.sum = sum + carry as u16;
    }

    /// Adds `u16` formed by two `u8`s to the checksum value.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds two `u16`s to the checksum value by splitting a `u32` in half.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds a run of bytes. Runs may be fed one after another, as with the
    /// chunks of a buffer chain; an odd byte at the end of one run pairs up
    /// with the first byte of the next.
    pub fn accumulate(&mut self, bytes: &[u8]) {
        let mut bytes = bytes.iter().copied();
        if let Some(high) = self.pending.take() {
            match bytes.next() {
                Some(low) => self.add_u8(high, low),
                None => {
                    self.pending = Some(high);
                    return;
                }
            }
        }
        while let Some(high) = bytes.next() {
            match bytes.next() {
                Some(low) => self.add_u8(high, low),
                None => self.pending = Some(high),
            }
        }
    }

    /// Adds the TCP/UDP pseudo header for IPv4.
    pub fn add_pseudo_header(
        &mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        protocol: u8,
        length: u16,
    ) {
        self.add_u32(src.into());
        self.add_u32(dst.into());
        self.add_u8(0, protocol);
        self.add_u16(length);
    }

    /// Computes the final checksum value. A trailing odd byte is padded with
    /// zero.
    pub fn as_u16(&self) -> u16 {
        let mut this = *self;
        if let Some(high) = this.pending.take() {
            this.add_u8(high, 0);
        }
        !this.sum
    }
}

/// One end of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

/// The pair of endpoints identifying a connection from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoints {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl Endpoints {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// The same connection seen from the remote side.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}
