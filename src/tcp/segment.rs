use super::tcp_parsing::{Control, TcpHeader};
use crate::buffer::{Chunk, Pbuf};

/// An outbound segment sitting in a connection's unsent or unacked queue.
///
/// The acknowledgement number, window and checksum in `header` stay blank
/// while the segment is queued. They are filled into a fresh copy of the
/// header every time the segment goes out.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    /// Raw option bytes following the fixed header
    pub options: Vec<u8>,
    pub payload: Pbuf,
    /// The header buffer of the most recent transmission
    pub(super) wire_header: Option<Chunk>,
}

impl Segment {
    pub fn new(header: TcpHeader, options: Vec<u8>, payload: Pbuf) -> Self {
        Self {
            header,
            options,
            payload,
            wire_header: None,
        }
    }

    /// The sequence number of the first octet (or of the SYN).
    pub fn seqno(&self) -> u32 {
        self.header.seq
    }

    /// The number of payload bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The length of the segment in sequence space, counting SYN and FIN as
    /// one octet each
    pub fn tcp_len(&self) -> u32 {
        self.payload.len() as u32
            + self.header.ctl.syn() as u32
            + self.header.ctl.fin() as u32
    }

    /// The sequence number following this segment.
    pub fn end_seq(&self) -> u32 {
        self.seqno().wrapping_add(self.tcp_len())
    }

    pub fn ctl(&self) -> Control {
        self.header.ctl
    }

    /// Whether a previous transmission of this segment is still referenced by
    /// a layer below.
    pub fn in_flight(&self) -> bool {
        self.payload.is_shared()
            || self
                .wire_header
                .as_ref()
                .map_or(false, |header| header.ref_count() > 1)
    }

    /// The number of buffers this segment counts against the queue limit.
    pub fn buffer_count(&self) -> usize {
        self.payload.chunk_count().max(1)
    }
}
