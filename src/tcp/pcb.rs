use super::{callbacks::Callbacks, segment::Segment, State};
use crate::{
    config::TcpConfig,
    utility::{Endpoint, Endpoints},
};
use std::{
    collections::VecDeque,
    fmt::{self, Display},
};

/// Identifies a connection block within one [`TcpStack`](super::TcpStack).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PcbId(pub(super) u32);

impl Display for PcbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb#{}", self.0)
    }
}

/// Per-connection flag bits.
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct PcbFlags(u8);

impl PcbFlags {
    /// An ACK is owed and will go out on the next fast timer tick.
    pub const ACK_DELAY: Self = Self(0x01);
    /// An ACK must go out on the next output.
    pub const ACK_NOW: Self = Self(0x02);
    /// In fast recovery.
    pub const INFR: Self = Self(0x04);
    /// The peer's FIN arrived and the application has not been told yet.
    pub const GOT_FIN: Self = Self(0x08);
    /// A received segment is being delivered to the application.
    pub const IN_RECV: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PcbFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PcbFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PcbFlags, &str); 5] = [
            (PcbFlags::ACK_DELAY, "ACK_DELAY"),
            (PcbFlags::ACK_NOW, "ACK_NOW"),
            (PcbFlags::INFR, "INFR"),
            (PcbFlags::GOT_FIN, "GOT_FIN"),
            (PcbFlags::IN_RECV, "IN_RECV"),
        ];
        f.debug_list()
            .entries(
                NAMES
                    .iter()
                    .filter(|(bit, _)| self.contains(*bit))
                    .map(|(_, name)| name),
            )
            .finish()
    }
}

/// The connection control block: the full state of one end of a connection
/// that is not listening.
///
/// Sequence numbers are raw `u32`s and must be compared with the helpers in
/// [`seq`](super::seq). Timer fields count coarse ticks.
pub struct Pcb {
    pub id: PcbId,
    pub state: State,
    pub endpoints: Endpoints,
    pub flags: PcbFlags,

    // Receiver variables
    /// Next sequence number expected from the peer
    pub rcv_nxt: u32,
    /// Receive window currently available
    pub rcv_wnd: u32,

    // Timers
    /// Tick of the last activity, used by the FIN_WAIT_2, SYN_RCVD and
    /// TIME_WAIT timeouts
    pub tmr: u32,
    pub polltmr: u8,
    /// Poll interval in coarse ticks
    pub pollinterval: u8,
    /// Ticks since the retransmission timer was last reset
    pub rtime: u32,
    /// Maximum segment size of outgoing segments
    pub mss: u16,

    // RTT estimation
    /// Tick at which the segment being timed went out
    pub rttest: Option<u32>,
    /// Sequence number of the segment being timed
    pub rtseq: u32,
    /// Smoothed round trip time, scaled by 8
    pub sa: i32,
    /// Round trip time deviation, scaled by 4
    pub sv: i32,
    /// Retransmission timeout in ticks
    pub rto: u32,
    /// Number of retransmissions of the oldest outstanding data
    pub nrtx: u8,

    // Fast retransmit and recovery
    /// Highest acknowledged sequence number
    pub lastack: u32,
    pub dupacks: u8,

    // Congestion avoidance
    pub cwnd: u32,
    pub ssthresh: u32,

    // Sender variables
    /// Next sequence number to send
    pub snd_nxt: u32,
    /// Highest sequence number sent
    pub snd_max: u32,
    /// Window advertised by the peer
    pub snd_wnd: u32,
    /// Sequence number of the last window update
    pub snd_wl1: u32,
    /// Acknowledgement number of the last window update
    pub snd_wl2: u32,
    /// Sequence number following the last byte queued
    pub snd_lbb: u32,
    /// Bytes of send buffer still available
    pub snd_buf: usize,
    /// Buffers currently queued
    pub snd_queuelen: usize,

    /// Segments not yet transmitted, in sequence order
    pub unsent: VecDeque<Segment>,
    /// Segments transmitted but not yet acknowledged, in sequence order
    pub unacked: VecDeque<Segment>,

    /// The listener that created this block through a passive open
    pub listener: Option<PcbId>,
    pub(super) callbacks: Option<Box<dyn Callbacks>>,
}

impl Pcb {
    /// Creates a closed block with the initial send sequence number `iss`.
    pub(super) fn new(id: PcbId, config: &TcpConfig, iss: u32, ticks: u32) -> Self {
        let rto = config.initial_rto();
        Self {
            id,
            state: State::Closed,
            endpoints: Endpoints::default(),
            flags: PcbFlags::empty(),
            rcv_nxt: 0,
            rcv_wnd: config.wnd,
            tmr: ticks,
            polltmr: 0,
            pollinterval: 0,
            rtime: 0,
            mss: config.mss,
            rttest: None,
            rtseq: 0,
            sa: 0,
            sv: rto as i32,
            rto,
            nrtx: 0,
            lastack: iss,
            dupacks: 0,
            cwnd: 1,
            ssthresh: 0,
            snd_nxt: iss,
            snd_max: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: iss,
            snd_lbb: iss,
            snd_buf: config.snd_buf,
            snd_queuelen: 0,
            unsent: VecDeque::new(),
            unacked: VecDeque::new(),
            listener: None,
            callbacks: None,
        }
    }

    pub fn local(&self) -> Endpoint {
        self.endpoints.local
    }

    pub fn remote(&self) -> Endpoint {
        self.endpoints.remote
    }

    /// The window advertised to the peer. Windows smaller than one segment
    /// are advertised as zero.
    pub fn advertised_wnd(&self) -> u16 {
        if self.rcv_wnd < self.mss as u32 {
            0
        } else {
            self.rcv_wnd.min(u16::MAX as u32) as u16
        }
    }

    /// The amount of data that may be outstanding, in bytes.
    pub fn effective_wnd(&self) -> u32 {
        self.snd_wnd.min(self.cwnd)
    }

    /// Bytes sent but not yet acknowledged.
    pub fn flight_size(&self) -> u32 {
        self.snd_max.wrapping_sub(self.lastack)
    }

    /// Drops every queued segment and returns their buffers to the pool.
    pub fn purge(&mut self) {
        if matches!(self.state, State::Closed | State::TimeWait | State::Listen) {
            return;
        }
        if !self.unsent.is_empty() || !self.unacked.is_empty() {
            tracing::trace!(
                "{}: purging {} unsent and {} unacked segments",
                self.id,
                self.unsent.len(),
                self.unacked.len()
            );
        }
        self.unsent.clear();
        self.unacked.clear();
        self.snd_queuelen = 0;
    }

    /// Restarts the retransmission timeout from the RTT estimate.
    pub(super) fn reset_rto(&mut self) {
        self.rto = ((self.sa >> 3) + self.sv).max(1) as u32;
    }
}

impl fmt::Debug for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pcb")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("endpoints", &self.endpoints)
            .field("flags", &self.flags)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("rcv_wnd", &self.rcv_wnd)
            .field("snd_nxt", &self.snd_nxt)
            .field("snd_max", &self.snd_max)
            .field("lastack", &self.lastack)
            .field("snd_wnd", &self.snd_wnd)
            .field("cwnd", &self.cwnd)
            .field("ssthresh", &self.ssthresh)
            .field("snd_buf", &self.snd_buf)
            .field("unsent", &self.unsent.len())
            .field("unacked", &self.unacked.len())
            .finish_non_exhaustive()
    }
}

/// A connection block in the LISTEN state. It carries only what a passive
/// open needs.
pub struct ListenPcb {
    pub id: PcbId,
    pub local: Endpoint,
    pub(super) callbacks: Option<Box<dyn Callbacks>>,
}

impl fmt::Debug for ListenPcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenPcb")
            .field("id", &self.id)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
