//! The TCP engine: connection blocks, the segment queues that turn
//! application writes into wire segments, and the output, retransmission and
//! reset paths.
//!
//! A [`TcpStack`] owns every connection block together with the three lists
//! that partition them by state. Every entry point takes `&mut self`, which
//! makes packet arrival, timer ticks and application calls mutually exclusive
//! by construction. To drive a stack from several tasks, hand it to
//! [`driver::spawn`](crate::driver::spawn).

use crate::{
    buffer::PbufPool,
    config::TcpConfig,
    ip::{IpLayer, Ipv4Address},
    utility::{Endpoint, Endpoints},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::Serialize;

mod callbacks;
pub use callbacks::Callbacks;

mod enqueue;
pub use enqueue::WriteMode;

mod error;
pub use error::{MemoryError, TcpError};

mod events;
pub use events::Arrival;

mod output;
use output::Tx;

mod pcb;
pub use pcb::{ListenPcb, Pcb, PcbFlags, PcbId};

mod registry;
pub use registry::{PcbList, Registry, RegistryError};

mod segment;
pub use segment::Segment;

pub mod seq;

mod state;
pub use state::State;

mod tcp_parsing;
pub use tcp_parsing::{
    BuildHeaderError, Control, ParseError, ParsedSegment, TcpHeader, TcpHeaderBuilder,
};

mod timer;

#[cfg(test)]
mod tests;

/// Counters kept by a stack.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TcpStats {
    /// Segments handed to IP
    pub xmit: u64,
    /// Segments handed to IP that had been sent before
    pub rexmit: u64,
    /// Allocation failures
    pub memerr: u64,
    /// Transmissions abandoned for lack of a route
    pub rterr: u64,
    /// Other errors
    pub err: u64,
}

/// One instance of the TCP protocol.
pub struct TcpStack {
    config: TcpConfig,
    pool: PbufPool,
    ip: Box<dyn IpLayer>,
    /// Every connection block that is not listening
    pcbs: FxHashMap<PcbId, Pcb>,
    listeners: FxHashMap<PcbId, ListenPcb>,
    registry: Registry,
    /// Coarse timer ticks since the stack started
    ticks: u32,
    next_id: u32,
    /// The most recently assigned ephemeral port
    last_port: u16,
    rng: SmallRng,
    stats: TcpStats,
}

impl TcpStack {
    /// Creates a stack that sends through `ip` and allocates from `pool`.
    pub fn new(config: TcpConfig, ip: impl IpLayer + 'static, pool: PbufPool) -> Self {
        let rng = match config.iss_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            last_port: config.first_port,
            config,
            pool,
            ip: Box::new(ip),
            pcbs: FxHashMap::default(),
            listeners: FxHashMap::default(),
            registry: Registry::new(),
            ticks: 0,
            next_id: 0,
            rng,
            stats: TcpStats::default(),
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    pub fn pool(&self) -> &PbufPool {
        &self.pool
    }

    pub fn stats(&self) -> TcpStats {
        self.stats
    }

    /// Coarse timer ticks elapsed.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Creates a closed connection block that is on no list yet.
    pub fn new_pcb(&mut self) -> PcbId {
        let id = self.alloc_id();
        let iss = self.next_iss();
        let pcb = Pcb::new(id, &self.config, iss, self.ticks);
        self.pcbs.insert(id, pcb);
        id
    }

    /// The connection block behind `id`, unless it is listening.
    pub fn pcb(&self, id: PcbId) -> Option<&Pcb> {
        self.pcbs.get(&id)
    }

    /// Mutable access for the input path and for tests.
    pub fn pcb_mut(&mut self, id: PcbId) -> Option<&mut Pcb> {
        self.pcbs.get_mut(&id)
    }

    pub fn listener(&self, id: PcbId) -> Option<&ListenPcb> {
        self.listeners.get(&id)
    }

    /// The state of any connection block, listening or not.
    pub fn state(&self, id: PcbId) -> Option<State> {
        match self.pcbs.get(&id) {
            Some(pcb) => Some(pcb.state),
            None => self.listeners.get(&id).map(|_| State::Listen),
        }
    }

    /// Verifies the invariants of the three lists against the blocks' states,
    /// and that every block past CLOSED is on one of them.
    pub fn check_registry(&self) -> Result<(), RegistryError> {
        self.registry.check(|id| self.state(id))?;
        let unlisted = self
            .pcbs
            .iter()
            .filter(|(_, pcb)| pcb.state != State::Closed)
            .map(|(&id, _)| id)
            .chain(self.listeners.keys().copied())
            .find(|&id| self.registry.which(id).is_none());
        match unlisted {
            Some(id) => Err(RegistryError::Unlisted(id)),
            None => Ok(()),
        }
    }

    /// Binds a closed connection block to a local address and port. Port zero
    /// picks a free ephemeral port. Binding to [`Ipv4Address::ANY`] takes the
    /// address of the outgoing interface on first transmission.
    pub fn bind(&mut self, id: PcbId, address: Ipv4Address, port: u16) -> Result<u16, TcpError> {
        let state = self.get(id)?.state;
        if state != State::Closed {
            return Err(TcpError::InvalidState(state));
        }
        let port = if port == 0 {
            self.new_port()?
        } else {
            if self.port_in_use(address, port) {
                return Err(TcpError::AddressInUse(port));
            }
            port
        };
        let pcb = self.get_mut(id)?;
        pcb.endpoints.local = Endpoint::new(address, port);
        tracing::debug!("{id}: bound to port {port}");
        Ok(port)
    }

    /// Turns a closed connection block into a listening one. The block keeps
    /// its id and its callbacks; accepted connections are announced through
    /// [`Callbacks::accepted`].
    pub fn listen(&mut self, id: PcbId) -> Result<(), TcpError> {
        let state = self.get(id)?.state;
        if state != State::Closed {
            return Err(TcpError::InvalidState(state));
        }
        if self.get(id)?.local().port == 0 {
            self.bind(id, Ipv4Address::ANY, 0)?;
        }
        let pcb = self.pcbs.remove(&id).ok_or(TcpError::UnknownPcb(id))?;
        self.listeners.insert(
            id,
            ListenPcb {
                id,
                local: pcb.local(),
                callbacks: pcb.callbacks,
            },
        );
        self.registry.register(PcbList::Listen, id);
        Ok(())
    }

    /// Starts an active open towards `address:port`. The SYN carries an MSS
    /// option and goes out immediately; [`Callbacks::connected`] runs once the
    /// SYN-ACK arrives.
    pub fn connect(&mut self, id: PcbId, address: Ipv4Address, port: u16) -> Result<(), TcpError> {
        let state = self.get(id)?.state;
        if state != State::Closed {
            return Err(TcpError::InvalidState(state));
        }
        if address.is_any() || port == 0 {
            return Err(TcpError::InvalidArgument("connect needs a remote address and port"));
        }
        if self.get(id)?.local().port == 0 {
            let local_port = self.new_port()?;
            self.get_mut(id)?.endpoints.local.port = local_port;
        }

        let iss = self.next_iss();
        let config = &self.config;
        let pcb = self.pcbs.get_mut(&id).ok_or(TcpError::UnknownPcb(id))?;
        pcb.endpoints.remote = Endpoint::new(address, port);
        pcb.rcv_nxt = 0;
        pcb.snd_nxt = iss;
        pcb.snd_max = iss;
        pcb.lastack = iss;
        pcb.snd_lbb = iss;
        pcb.snd_wl2 = iss;
        pcb.rcv_wnd = config.wnd;
        pcb.snd_wnd = config.wnd;
        pcb.mss = config.mss;
        pcb.cwnd = 1;
        pcb.ssthresh = pcb.mss as u32 * 10;
        pcb.state = State::SynSent;
        self.registry.register(PcbList::Active, id);
        tracing::debug!("{id}: connecting to {address}:{port}");

        let mss = self.get(id)?.mss;
        if let Err(e) = self.enqueue(id, &[], Control::SYN, &tcp_parsing::mss_option(mss)) {
            self.registry.remove(id);
            let pcb = self.get_mut(id)?;
            pcb.state = State::Closed;
            pcb.endpoints.remote = Endpoint::default();
            return Err(e);
        }
        self.output(id)
    }

    /// Queues a FIN, or drops the block outright if nothing was ever sent.
    pub fn close(&mut self, id: PcbId) -> Result<(), TcpError> {
        if self.listeners.remove(&id).is_some() {
            self.registry.remove(id);
            tracing::debug!("{id}: stopped listening");
            return Ok(());
        }
        match self.get(id)?.state {
            State::Closed | State::SynSent => {
                self.remove_pcb(id);
                Ok(())
            }
            State::SynReceived | State::Established => {
                self.send_ctrl(id, Control::FIN)?;
                self.get_mut(id)?.state = State::FinWait1;
                self.output(id)
            }
            State::CloseWait => {
                self.send_ctrl(id, Control::FIN)?;
                self.get_mut(id)?.state = State::LastAck;
                self.output(id)
            }
            // Already closing
            _ => Ok(()),
        }
    }

    /// Drops the connection at once. The peer gets a RST unless the block was
    /// listening or in TIME_WAIT, and [`Callbacks::error`] sees
    /// [`TcpError::Aborted`].
    pub fn abort(&mut self, id: PcbId) -> Result<(), TcpError> {
        if self.listeners.remove(&id).is_some() {
            self.registry.remove(id);
            return Ok(());
        }
        let state = self.get(id)?.state;
        let mut pcb = self.remove_pcb(id).ok_or(TcpError::UnknownPcb(id))?;
        if matches!(state, State::Closed | State::TimeWait) {
            return Ok(());
        }
        if let Some(mut callbacks) = pcb.callbacks.take() {
            callbacks.error(id, TcpError::Aborted);
        }
        tracing::debug!("{id}: aborting, sending RST");
        self.rst(pcb.snd_nxt, pcb.rcv_nxt, pcb.endpoints);
        Ok(())
    }

    /// Tells the stack the application consumed `len` bytes, reopening the
    /// receive window.
    pub fn recved(&mut self, id: PcbId, len: u32) -> Result<(), TcpError> {
        let wnd = self.config.wnd;
        let pcb = self.get_mut(id)?;
        pcb.rcv_wnd = pcb.rcv_wnd.saturating_add(len).min(wnd);
        let flags = pcb.flags;
        if !flags.contains(PcbFlags::ACK_DELAY) && !flags.contains(PcbFlags::ACK_NOW) {
            self.ack(id)?;
        }
        Ok(())
    }

    /// Owes the peer an ACK. The first call delays it until the next fast
    /// timer tick; a second call before then sends it right away.
    pub fn ack(&mut self, id: PcbId) -> Result<(), TcpError> {
        let pcb = self.get_mut(id)?;
        if pcb.flags.contains(PcbFlags::ACK_DELAY) {
            self.ack_now(id)
        } else {
            pcb.flags.insert(PcbFlags::ACK_DELAY);
            Ok(())
        }
    }

    /// Sends an ACK now, piggybacked on data if any can go out.
    pub fn ack_now(&mut self, id: PcbId) -> Result<(), TcpError> {
        let pcb = self.get_mut(id)?;
        pcb.flags.remove(PcbFlags::ACK_DELAY);
        pcb.flags.insert(PcbFlags::ACK_NOW);
        self.output(id)
    }

    /// The send buffer credit left, in bytes.
    pub fn sndbuf(&self, id: PcbId) -> Result<usize, TcpError> {
        Ok(self.get(id)?.snd_buf)
    }

    /// Installs the application's callbacks on a connection or listener.
    pub fn set_callbacks(
        &mut self,
        id: PcbId,
        callbacks: Box<dyn Callbacks>,
    ) -> Result<(), TcpError> {
        if let Some(listener) = self.listeners.get_mut(&id) {
            listener.callbacks = Some(callbacks);
            return Ok(());
        }
        self.get_mut(id)?.callbacks = Some(callbacks);
        Ok(())
    }

    /// Makes [`Callbacks::poll`] run every `interval` coarse ticks.
    pub fn set_poll(&mut self, id: PcbId, interval: u8) -> Result<(), TcpError> {
        self.get_mut(id)?.pollinterval = interval;
        Ok(())
    }

    /// Finds the connection a segment with these endpoints belongs to: an
    /// exact match among active and TIME_WAIT blocks first, then a listener on
    /// the local port.
    pub fn lookup(&self, endpoints: Endpoints) -> Option<PcbId> {
        let exact = |list| {
            self.registry
                .iter(list)
                .find(|id| self.pcbs.get(id).map_or(false, |pcb| pcb.endpoints == endpoints))
        };
        exact(PcbList::Active)
            .or_else(|| exact(PcbList::TimeWait))
            .or_else(|| {
                self.registry.iter(PcbList::Listen).find(|id| {
                    self.listeners.get(id).map_or(false, |listener| {
                        listener.local.port == endpoints.local.port
                            && (listener.local.address.is_any()
                                || listener.local.address == endpoints.local.address)
                    })
                })
            })
    }

    /// Takes a block off its list, drops its queues and marks it closed. An
    /// owed ACK goes out first.
    fn remove_pcb(&mut self, id: PcbId) -> Option<Pcb> {
        self.registry.remove(id);
        let mut pcb = self.pcbs.remove(&id)?;
        pcb.purge();
        if !matches!(pcb.state, State::TimeWait | State::Closed)
            && pcb.flags.contains(PcbFlags::ACK_DELAY)
        {
            if let Err(e) = self.tx().send_ack(&mut pcb) {
                tracing::debug!("{id}: final ACK not sent: {e}");
            }
        }
        pcb.state = State::Closed;
        Some(pcb)
    }

    /// Moves a block onto the TIME_WAIT list.
    fn enter_time_wait(&mut self, id: PcbId) -> Result<(), TcpError> {
        let ticks = self.ticks;
        let pcb = self.get_mut(id)?;
        pcb.purge();
        pcb.state = State::TimeWait;
        pcb.tmr = ticks;
        self.registry.remove(id);
        self.registry.register(PcbList::TimeWait, id);
        tracing::debug!("{id}: entering TIME_WAIT");
        Ok(())
    }

    /// Runs `f` with the callbacks of `id` detached from the block. Returns
    /// `None` if the block has no callbacks.
    fn with_callbacks<R>(
        &mut self,
        id: PcbId,
        f: impl FnOnce(&mut dyn Callbacks, &mut Self) -> R,
    ) -> Option<R> {
        let mut callbacks = self.pcbs.get_mut(&id)?.callbacks.take()?;
        let result = f(callbacks.as_mut(), self);
        if let Some(pcb) = self.pcbs.get_mut(&id) {
            pcb.callbacks.get_or_insert(callbacks);
        }
        Some(result)
    }

    fn get(&self, id: PcbId) -> Result<&Pcb, TcpError> {
        self.pcbs.get(&id).ok_or(TcpError::UnknownPcb(id))
    }

    fn get_mut(&mut self, id: PcbId) -> Result<&mut Pcb, TcpError> {
        self.pcbs.get_mut(&id).ok_or(TcpError::UnknownPcb(id))
    }

    /// Borrows a block together with everything the output path needs.
    fn split(&mut self, id: PcbId) -> Result<(&mut Pcb, Tx<'_>), TcpError> {
        let pcb = self.pcbs.get_mut(&id).ok_or(TcpError::UnknownPcb(id))?;
        let tx = Tx {
            ip: &mut self.ip,
            pool: &self.pool,
            config: &self.config,
            stats: &mut self.stats,
            ticks: self.ticks,
        };
        Ok((pcb, tx))
    }

    fn tx(&mut self) -> Tx<'_> {
        Tx {
            ip: &mut self.ip,
            pool: &self.pool,
            config: &self.config,
            stats: &mut self.stats,
            ticks: self.ticks,
        }
    }

    fn alloc_id(&mut self) -> PcbId {
        self.next_id += 1;
        PcbId(self.next_id)
    }

    fn next_iss(&mut self) -> u32 {
        self.rng.gen()
    }

    fn port_in_use(&self, address: Ipv4Address, port: u16) -> bool {
        let clashes = |local: Endpoint| {
            local.port == port
                && (local.address.is_any() || address.is_any() || local.address == address)
        };
        self.listeners.values().any(|listener| clashes(listener.local))
            || self
                .registry
                .iter(PcbList::Active)
                .filter_map(|id| self.pcbs.get(&id))
                .any(|pcb| clashes(pcb.local()))
    }

    /// Picks the next ephemeral port that no block uses.
    fn new_port(&mut self) -> Result<u16, TcpError> {
        let (first, last) = (self.config.first_port, self.config.last_port);
        let range = match last.checked_sub(first) {
            Some(span) if first != 0 => span as usize + 1,
            _ => return Err(TcpError::InvalidArgument("ephemeral port range is empty")),
        };
        for _ in 0..range {
            self.last_port = if self.last_port >= last || self.last_port < first {
                first
            } else {
                self.last_port + 1
            };
            let port = self.last_port;
            let used = self.listeners.values().any(|l| l.local.port == port)
                || self.pcbs.values().any(|pcb| {
                    pcb.state != State::Closed && pcb.local().port == port
                });
            if !used {
                return Ok(port);
            }
        }
        Err(TcpError::AddressInUse(0))
    }
}

impl std::fmt::Debug for TcpStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStack")
            .field("ticks", &self.ticks)
            .field("pcbs", &self.pcbs.len())
            .field("listeners", &self.listeners.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
