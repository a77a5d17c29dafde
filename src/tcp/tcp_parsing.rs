//! TCP header layout, serialization and parsing.

use crate::{
    buffer::Pbuf,
    ip::{Ipv4Address, PROTO_TCP},
    utility::Checksum,
};
use thiserror::Error as ThisError;

/// The number of 32-bit words in a TCP header without options
pub const BASE_HEADER_WORDS: u8 = 5;
/// The number of bytes in a TCP header without options
pub const BASE_HEADER_OCTETS: usize = BASE_HEADER_WORDS as usize * 4;
/// The most option bytes a header can carry
pub const MAX_OPTION_OCTETS: usize = 40;

/// Byte offset of the acknowledgement number within the header
const ACK_OFFSET: usize = 8;
/// Byte offset of the flag byte within the header
const FLAGS_OFFSET: usize = 13;
/// Byte offset of the window within the header
const WND_OFFSET: usize = 14;
/// Byte offset of the checksum within the header
const CHECKSUM_OFFSET: usize = 16;

/// The fixed part of a TCP header
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number
    pub src_port: u16,
    /// The destination port number
    pub dst_port: u16,
    /// The sequence number of the first data octet in this segment, or the
    /// initial sequence number if SYN is set
    pub seq: u32,
    /// The next sequence number the sender expects to receive, valid when ACK
    /// is set
    pub ack: u32,
    /// The number of 32-bit words in the header, options included
    pub data_offset: u8,
    /// Control bits
    pub ctl: Control,
    /// The number of octets the sender is willing to accept
    pub wnd: u16,
    /// The header checksum
    pub checksum: u16,
    /// Offset of the urgent pointer from `seq`, valid when URG is set
    pub urg: u16,
}

impl TcpHeader {
    /// Size of the header in bytes, options included
    pub fn bytes(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Writes the fixed header followed by `options` in wire format.
    pub fn serialize(&self, options: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(BASE_HEADER_OCTETS + options.len());
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.data_offset << 4);
        out.push(self.ctl.into());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urg.to_be_bytes());
        out.extend_from_slice(options);
        out
    }

    /// Parses a segment and verifies its checksum against the pseudo header.
    pub fn from_bytes(
        packet: &[u8],
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<ParsedSegment<'_>, ParseError> {
        let parsed = Self::from_bytes_unchecked(packet)?;
        let length: u16 = packet
            .len()
            .try_into()
            .map_err(|_| ParseError::PacketTooLong)?;
        let mut checksum = Checksum::new();
        checksum.add_pseudo_header(src_address, dst_address, PROTO_TCP, length);
        checksum.accumulate(&packet[..CHECKSUM_OFFSET]);
        checksum.accumulate(&packet[CHECKSUM_OFFSET + 2..]);
        let actual = checksum.as_u16();
        if actual == parsed.header.checksum {
            Ok(parsed)
        } else {
            Err(ParseError::Checksum {
                actual,
                expected: parsed.header.checksum,
            })
        }
    }

    /// Parses a segment without looking at the checksum.
    pub fn from_bytes_unchecked(packet: &[u8]) -> Result<ParsedSegment<'_>, ParseError> {
        if packet.len() < BASE_HEADER_OCTETS {
            return Err(ParseError::HeaderTooShort);
        }
        let u16_at = |i: usize| u16::from_be_bytes([packet[i], packet[i + 1]]);
        let u32_at = |i: usize| {
            u32::from_be_bytes([packet[i], packet[i + 1], packet[i + 2], packet[i + 3]])
        };

        let data_offset = packet[12] >> 4;
        let header_len = data_offset as usize * 4;
        if data_offset < BASE_HEADER_WORDS {
            return Err(ParseError::DataOffset(data_offset));
        }
        if packet.len() < header_len {
            return Err(ParseError::HeaderTooShort);
        }

        let header = TcpHeader {
            src_port: u16_at(0),
            dst_port: u16_at(2),
            seq: u32_at(4),
            ack: u32_at(ACK_OFFSET),
            data_offset,
            ctl: Control::from(packet[FLAGS_OFFSET] & 0b11_1111),
            wnd: u16_at(WND_OFFSET),
            checksum: u16_at(CHECKSUM_OFFSET),
            urg: u16_at(18),
        };
        Ok(ParsedSegment {
            header,
            options: &packet[BASE_HEADER_OCTETS..header_len],
            payload: &packet[header_len..],
        })
    }
}

/// A segment split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSegment<'a> {
    pub header: TcpHeader,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl ParsedSegment<'_> {
    /// The maximum segment size announced in the options, if any.
    pub fn mss(&self) -> Option<u16> {
        let mut options = self.options;
        while let Some(&kind) = options.first() {
            match kind {
                // End of option list
                0 => break,
                // No-operation
                1 => options = &options[1..],
                _ => {
                    let len = *options.get(1)? as usize;
                    if len < 2 || len > options.len() {
                        return None;
                    }
                    if kind == 2 && len == 4 {
                        return Some(u16::from_be_bytes([options[2], options[3]]));
                    }
                    options = &options[len..];
                }
            }
        }
        None
    }
}

/// Builds the MSS option announced on SYN segments.
pub fn mss_option(mss: u16) -> [u8; 4] {
    let [high, low] = mss.to_be_bytes();
    [2, 4, high, low]
}

/// Writes `checksum` into a serialized header.
pub fn set_checksum(header: &mut [u8], checksum: u16) {
    header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
}

/// Computes the TCP checksum of a serialized header followed by its payload.
/// The header's own checksum field must be zero.
pub fn segment_checksum(
    header: &[u8],
    payload: &Pbuf,
    src_address: Ipv4Address,
    dst_address: Ipv4Address,
) -> Result<u16, BuildHeaderError> {
    let length: u16 = (header.len() + payload.len())
        .try_into()
        .map_err(|_| BuildHeaderError::OverlyLongPayload)?;
    let mut checksum = Checksum::new();
    checksum.add_pseudo_header(src_address, dst_address, PROTO_TCP, length);
    checksum.accumulate(header);
    for chunk in payload.chunks() {
        checksum.accumulate(chunk.as_slice());
    }
    Ok(checksum.as_u16())
}

/// An error that occurred while parsing a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("Too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("The packet length could not fit into a u16")]
    PacketTooLong,
    #[error("Data offset {0} is smaller than the fixed header")]
    DataOffset(u8),
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
}

/// Used for building a TCP header
#[derive(Debug, Clone)]
pub struct TcpHeaderBuilder {
    header: TcpHeader,
    options: Vec<u8>,
}

impl TcpHeaderBuilder {
    /// Initialize the TCP header with defaults and the given values
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self {
            header: TcpHeader {
                src_port,
                dst_port,
                seq,
                ack: 0,
                ctl: Control::default(),
                wnd: 0,
                urg: 0,

                // Filled in by .build()
                data_offset: 0,
                checksum: 0,
            },
            options: Vec::new(),
        }
    }

    /// Set the window size
    pub fn wnd(mut self, wnd: u16) -> Self {
        self.header.wnd = wnd;
        self
    }

    /// Set the acknowledgement number
    pub fn ack(mut self, ack: u32) -> Self {
        self.header.ack = ack;
        self.header.ctl.set_ack(true);
        self
    }

    /// Add the given control bits
    pub fn ctl(mut self, ctl: Control) -> Self {
        self.header.ctl = self.header.ctl | ctl;
        self
    }

    /// Set the rst bit up
    pub fn rst(mut self) -> Self {
        self.header.ctl.set_rst(true);
        self
    }

    /// Append raw option bytes after the fixed header
    pub fn options(mut self, options: &[u8]) -> Self {
        self.options.extend_from_slice(options);
        self
    }

    /// Finish the header. The checksum is left zero; it covers the payload and
    /// is computed once the whole segment is assembled.
    pub fn build(self) -> Result<(TcpHeader, Vec<u8>), BuildHeaderError> {
        let options_len = self.options.len();
        if options_len % 4 != 0 || options_len > MAX_OPTION_OCTETS {
            return Err(BuildHeaderError::OptionsLength(options_len));
        }
        let mut header = self.header;
        header.data_offset = BASE_HEADER_WORDS + (options_len / 4) as u8;
        Ok((header, self.options))
    }
}

/// An error that occurred while building a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The TCP payload is longer than can fit into a single packet")]
    OverlyLongPayload,
    #[error("{0} option bytes do not fill whole header words within the limit")]
    OptionsLength(usize),
}

/// The control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);

    /// No bits set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the segment consumes one sequence number for a SYN or FIN
    pub const fn is_syn_or_fin(self) -> bool {
        self.intersects(Self(Self::SYN.0 | Self::FIN.0))
    }

    pub const fn urg(self) -> bool {
        self.contains(Self::URG)
    }

    pub const fn ack(self) -> bool {
        self.contains(Self::ACK)
    }

    pub fn set_ack(&mut self, state: bool) {
        self.set(Self::ACK, state);
    }

    pub const fn psh(self) -> bool {
        self.contains(Self::PSH)
    }

    pub fn set_psh(&mut self, state: bool) {
        self.set(Self::PSH, state);
    }

    pub const fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    pub fn set_rst(&mut self, state: bool) {
        self.set(Self::RST, state);
    }

    pub const fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub const fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    fn set(&mut self, bits: Self, state: bool) {
        if state {
            self.0 |= bits.0;
        } else {
            self.0 &= !bits.0;
        }
    }
}

impl std::ops::BitOr for Control {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(Control, &str); 6] = [
            (Control::URG, "URG"),
            (Control::ACK, "ACK"),
            (Control::PSH, "PSH"),
            (Control::RST, "RST"),
            (Control::SYN, "SYN"),
            (Control::FIN, "FIN"),
        ];
        write!(f, "Control(")?;
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{name}")?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PbufPool;

    const PAYLOAD: &[u8] = b"Hello, world!";
    const SRC_ADDRESS: Ipv4Address = Ipv4Address::LOCALHOST;
    const DST_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const SRC_PORT: u16 = 0xcafe;
    const DST_PORT: u16 = 0xbabe;
    const SEQUENCE: u32 = 123456789;
    const WINDOW: u16 = 1024;
    const ACKNOWLEDGEMENT: u32 = 10;

    fn build_expected() -> (etherparse::TcpHeader, Vec<u8>) {
        let mut expected = etherparse::TcpHeader::new(SRC_PORT, DST_PORT, SEQUENCE, WINDOW);
        expected.acknowledgment_number = ACKNOWLEDGEMENT;
        expected.ack = true;
        expected.psh = true;
        let ip_header = etherparse::Ipv4Header::new(
            (expected.header_len() as usize + PAYLOAD.len())
                .try_into()
                .unwrap(),
            30,
            etherparse::IpNumber::Tcp,
            SRC_ADDRESS.into(),
            DST_ADDRESS.into(),
        );
        expected.checksum = expected.calc_checksum_ipv4(&ip_header, PAYLOAD).unwrap();

        let mut serial = vec![];
        expected.write(&mut serial).unwrap();
        serial.extend_from_slice(PAYLOAD);
        (expected, serial)
    }

    fn build_actual() -> Vec<u8> {
        let pool = PbufPool::unbounded();
        let (header, options) = TcpHeaderBuilder::new(SRC_PORT, DST_PORT, SEQUENCE)
            .wnd(WINDOW)
            .ctl(Control::PSH)
            .ack(ACKNOWLEDGEMENT)
            .build()
            .unwrap();
        let mut header = header.serialize(&options);
        let mut segment = Pbuf::from_chunk(pool.copy_from(&PAYLOAD[..5]).unwrap());
        segment.push_back(pool.copy_from(&PAYLOAD[5..]).unwrap());
        let checksum = segment_checksum(&header, &segment, SRC_ADDRESS, DST_ADDRESS).unwrap();
        set_checksum(&mut header, checksum);
        segment.header(pool.copy_from(&header).unwrap());
        segment.to_vec()
    }

    #[test]
    fn builds_packet() {
        let (_, expected) = build_expected();
        assert_eq!(expected, build_actual());
    }

    #[test]
    fn parses_packet() {
        let (expected, serial) = build_expected();
        let parsed = TcpHeader::from_bytes(&serial, SRC_ADDRESS, DST_ADDRESS).unwrap();
        let actual = parsed.header;

        assert_eq!(actual.src_port, SRC_PORT);
        assert_eq!(actual.dst_port, DST_PORT);
        assert_eq!(actual.seq, SEQUENCE);
        assert_eq!(actual.ack, ACKNOWLEDGEMENT);
        assert_eq!(actual.ctl, Control::ACK | Control::PSH);
        assert_eq!(actual.wnd, WINDOW);
        assert_eq!(actual.checksum, expected.checksum);
        assert_eq!(actual.bytes(), BASE_HEADER_OCTETS);
        assert_eq!(parsed.payload, PAYLOAD);
        assert!(parsed.options.is_empty());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let (_, mut serial) = build_expected();
        let last = serial.len() - 1;
        serial[last] ^= 0xff;
        assert!(matches!(
            TcpHeader::from_bytes(&serial, SRC_ADDRESS, DST_ADDRESS),
            Err(ParseError::Checksum { .. })
        ));
    }

    #[test]
    fn options_widen_data_offset() {
        let (header, options) = TcpHeaderBuilder::new(1, 2, 3)
            .ctl(Control::SYN)
            .options(&mss_option(536))
            .build()
            .unwrap();
        assert_eq!(header.data_offset, 6);
        let bytes = header.serialize(&options);
        assert_eq!(bytes.len(), 24);

        let (parsed, _) = etherparse::TcpHeader::from_slice(&bytes).unwrap();
        assert_eq!(parsed.data_offset(), 6);
        assert!(parsed.syn);

        let ours = TcpHeader::from_bytes_unchecked(&bytes).unwrap();
        assert_eq!(ours.mss(), Some(536));
    }

    #[test]
    fn rejects_ragged_options() {
        let result = TcpHeaderBuilder::new(1, 2, 3).options(&[1, 1, 1]).build();
        assert_eq!(result.unwrap_err(), BuildHeaderError::OptionsLength(3));
    }

    #[test]
    fn control_works() {
        let control = Control::URG | Control::PSH | Control::SYN;
        assert!(control.urg());
        assert!(!control.ack());
        assert!(control.psh());
        assert!(!control.rst());
        assert!(control.syn());
        assert!(!control.fin());
        assert!(control.is_syn_or_fin());
        assert_eq!(format!("{control:?}"), "Control(URG, PSH, SYN)");

        let mut control = Control::FIN;
        control.set_ack(true);
        control.set_rst(true);
        assert_eq!(u8::from(control), 0x15);
        assert!(!Control::ACK.is_syn_or_fin());
    }
}
