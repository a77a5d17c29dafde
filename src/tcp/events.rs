//! Segment arrival: matching a segment to its connection and the hooks that
//! move the connection along when the peer's segments come in.
//!
//! [`TcpStack::input`] takes raw bytes from IP, [`TcpStack::deliver`] a
//! segment that is already parsed. Both end up in the per-event hooks, which
//! are public so that an input path of its own can drive them directly.

use super::{
    callbacks::Callbacks,
    pcb::{Pcb, PcbFlags},
    seq::{seq_between, seq_geq, seq_gt, seq_leq, seq_lt},
    tcp_parsing::{mss_option, Control, TcpHeader},
    PcbId, PcbList, State, TcpError, TcpStack,
};
use crate::{
    buffer::{Pbuf, PbufPool},
    ip::Ipv4Address,
    utility::{Endpoint, Endpoints},
};

/// A segment from the peer, parsed and addressed from this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    /// `local` is where the segment was sent to, `remote` where it came from
    pub endpoints: Endpoints,
    pub seqno: u32,
    pub ackno: u32,
    pub ctl: Control,
    pub wnd: u16,
    /// The MSS option, if the segment carried one
    pub mss: Option<u16>,
    pub payload: Pbuf,
}

impl Arrival {
    /// Parses a segment and verifies its checksum. The payload is copied into
    /// `pool`.
    pub fn parse(
        packet: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
        pool: &PbufPool,
    ) -> Result<Self, TcpError> {
        let parsed = TcpHeader::from_bytes(packet, src, dst)?;
        let payload = if parsed.payload.is_empty() {
            Pbuf::new()
        } else {
            Pbuf::from_chunk(pool.copy_from(parsed.payload)?)
        };
        let header = parsed.header;
        Ok(Self {
            endpoints: Endpoints::new(
                Endpoint::new(dst, header.dst_port),
                Endpoint::new(src, header.src_port),
            ),
            seqno: header.seq,
            ackno: header.ack,
            ctl: header.ctl,
            wnd: header.wnd,
            mss: parsed.mss().filter(|&mss| mss > 0),
            payload,
        })
    }

    /// The length in sequence space, SYN and FIN included.
    pub fn tcp_len(&self) -> u32 {
        self.payload.len() as u32 + self.ctl.syn() as u32 + self.ctl.fin() as u32
    }
}

/// What a segment brought for the application.
#[derive(Debug, Default)]
struct Received {
    acked: u32,
    data: Option<Pbuf>,
}

/// Stands in for the application on connections that have no callbacks.
struct Discard;

impl Callbacks for Discard {}

/// The congestion window a connection starts with once the handshake is done
/// (RFC 5681).
pub(super) fn initial_window(mss: u16) -> u32 {
    let mss = mss as u32;
    (4 * mss).min((2 * mss).max(4380))
}

impl TcpStack {
    /// Takes a TCP segment from IP. `src` and `dst` are the addresses of the
    /// datagram that carried it.
    pub fn input(
        &mut self,
        packet: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
    ) -> Result<(), TcpError> {
        let seg = match Arrival::parse(packet, src, dst, &self.pool) {
            Ok(seg) => seg,
            Err(e) => {
                match e {
                    TcpError::OutOfMemory(_) => self.stats.memerr += 1,
                    _ => self.stats.err += 1,
                }
                tracing::debug!("input: segment from {src} dropped: {e}");
                return Err(e);
            }
        };
        self.deliver(seg)
    }

    /// Hands a parsed segment to the connection it belongs to. A segment that
    /// belongs to no connection is answered with a RST.
    pub fn deliver(&mut self, seg: Arrival) -> Result<(), TcpError> {
        let id = match self.lookup(seg.endpoints) {
            Some(id) => id,
            None => {
                if !seg.ctl.rst() {
                    tracing::debug!(
                        "input: no connection for port {}, resetting",
                        seg.endpoints.local.port
                    );
                    self.rst(
                        seg.ackno,
                        seg.seqno.wrapping_add(seg.tcp_len()),
                        seg.endpoints,
                    );
                }
                return Ok(());
            }
        };

        if self.listeners.contains_key(&id) {
            return self.listen_input(id, &seg);
        }
        if seg.ctl.rst() {
            return self.rst_arrived(id, &seg);
        }

        let ticks = self.ticks;
        let pcb = self.get_mut(id)?;
        pcb.tmr = ticks;
        if pcb.state == State::TimeWait {
            return self.time_wait_input(id, &seg);
        }

        pcb.flags.insert(PcbFlags::IN_RECV);
        let processed = self.process(id, seg);
        if let Some(pcb) = self.pcbs.get_mut(&id) {
            pcb.flags.remove(PcbFlags::IN_RECV);
        }
        match processed? {
            Some(received) => self.notify(id, received),
            None => Ok(()),
        }
    }

    /// A passive open: a new block in SYN_RCVD answers the peer's SYN with a
    /// SYN-ACK carrying our MSS.
    pub fn syn_arrived(&mut self, listener: PcbId, seg: &Arrival) -> Result<PcbId, TcpError> {
        if !self.listeners.contains_key(&listener) {
            return Err(TcpError::UnknownPcb(listener));
        }
        let id = self.alloc_id();
        let iss = self.next_iss();
        let mut pcb = Pcb::new(id, &self.config, iss, self.ticks);
        pcb.state = State::SynReceived;
        pcb.endpoints = seg.endpoints;
        pcb.listener = Some(listener);
        pcb.rcv_nxt = seg.seqno.wrapping_add(1);
        pcb.snd_wnd = seg.wnd as u32;
        pcb.ssthresh = pcb.snd_wnd;
        pcb.snd_wl1 = seg.seqno.wrapping_sub(1);
        if let Some(mss) = seg.mss {
            pcb.mss = pcb.mss.min(mss);
        }
        let mss = pcb.mss;
        self.pcbs.insert(id, pcb);
        self.registry.register(PcbList::Active, id);
        tracing::debug!(
            "{listener}: connection request from {}:{}, new {id}",
            seg.endpoints.remote.address,
            seg.endpoints.remote.port
        );

        if let Err(e) = self.enqueue(id, &[], Control::SYN | Control::ACK, &mss_option(mss)) {
            self.registry.remove(id);
            self.pcbs.remove(&id);
            return Err(e);
        }
        self.output(id)?;
        Ok(id)
    }

    /// Completes an active open if `seg` is a SYN-ACK for our SYN. Runs
    /// [`Callbacks::connected`]; a failing callback aborts the connection.
    pub fn syn_ack_arrived(&mut self, id: PcbId, seg: &Arrival) -> Result<(), TcpError> {
        let ticks = self.ticks;
        let max_buf = self.config.snd_buf;
        let pcb = self.get_mut(id)?;
        let answers_syn = pcb
            .unacked
            .front()
            .map_or(false, |syn| syn.ctl().syn() && seg.ackno == syn.seqno().wrapping_add(1));
        if pcb.state != State::SynSent || !(seg.ctl.syn() && seg.ctl.ack()) || !answers_syn {
            tracing::trace!("{id}: ignoring segment in {}", pcb.state);
            return Ok(());
        }

        pcb.rcv_nxt = seg.seqno.wrapping_add(1);
        pcb.lastack = seg.ackno;
        pcb.snd_wnd = seg.wnd as u32;
        pcb.snd_wl1 = seg.seqno.wrapping_sub(1);
        pcb.snd_wl2 = seg.ackno;
        if let Some(mss) = seg.mss {
            pcb.mss = pcb.mss.min(mss);
        }
        pcb.cwnd = initial_window(pcb.mss);
        pcb.sample_rtt(seg.ackno, ticks);
        if let Some(syn) = pcb.unacked.pop_front() {
            pcb.snd_queuelen = pcb.snd_queuelen.saturating_sub(syn.buffer_count());
            // The SYN octet was charged against the send buffer
            pcb.snd_buf = (pcb.snd_buf + 1).min(max_buf);
        }
        pcb.rtime = 0;
        pcb.nrtx = 0;
        pcb.state = State::Established;
        tracing::debug!("{id}: connection established");

        if let Some(Err(e)) = self.with_callbacks(id, |callbacks, stack| callbacks.connected(stack, id))
        {
            tracing::debug!("{id}: connected callback failed: {e}");
            if self.pcbs.contains_key(&id) {
                self.abort(id)?;
            }
            return Ok(());
        }
        if self.pcbs.contains_key(&id) {
            self.ack_now(id)?;
        }
        Ok(())
    }

    /// Processes the acknowledgement carried by `seg`: window update,
    /// duplicate ACK counting and fast retransmit, retirement of acknowledged
    /// segments, congestion window growth and the RTT sample. Returns the
    /// number of newly acknowledged data octets.
    pub fn ack_arrived(&mut self, id: PcbId, seg: &Arrival) -> Result<u32, TcpError> {
        let max_buf = self.config.snd_buf;
        let (pcb, mut tx) = self.split(id)?;
        let ackno = seg.ackno;
        let wnd = seg.wnd as u32;

        let right_edge = pcb.snd_wl1.wrapping_add(pcb.snd_wnd);
        if seq_lt(pcb.snd_wl1, seg.seqno)
            || (pcb.snd_wl1 == seg.seqno && seq_lt(pcb.snd_wl2, ackno))
            || (pcb.snd_wl2 == ackno && wnd > pcb.snd_wnd)
        {
            pcb.snd_wnd = wnd;
            pcb.snd_wl1 = seg.seqno;
            pcb.snd_wl2 = ackno;
            tracing::trace!("{id}: window update {wnd}");
        }

        let mut acked = 0;
        if ackno == pcb.lastack {
            let same_edge = pcb.snd_wl1.wrapping_add(pcb.snd_wnd) == right_edge;
            if seg.tcp_len() == 0 && same_edge && !pcb.unacked.is_empty() {
                pcb.dupacks = pcb.dupacks.saturating_add(1);
                if pcb.dupacks >= 3 && pcb.state == State::Established {
                    let mss = pcb.mss as u32;
                    if !pcb.flags.contains(PcbFlags::INFR) {
                        tracing::debug!(
                            "{id}: {} duplicate ACKs for {ackno}, fast retransmit",
                            pcb.dupacks
                        );
                        tx.rexmit_first(pcb);
                        pcb.ssthresh = (pcb.flight_size() / 2).max(2 * mss);
                        pcb.cwnd = pcb.ssthresh + 3 * mss;
                        pcb.flags.insert(PcbFlags::INFR);
                    } else {
                        pcb.cwnd = pcb.cwnd.saturating_add(mss);
                    }
                }
            }
        } else if seq_lt(pcb.lastack, ackno) && seq_leq(ackno, pcb.snd_max) {
            if pcb.flags.contains(PcbFlags::INFR) {
                pcb.flags.remove(PcbFlags::INFR);
                pcb.cwnd = pcb.ssthresh;
            }
            pcb.nrtx = 0;
            pcb.reset_rto();

            let advanced = ackno.wrapping_sub(pcb.lastack);
            pcb.dupacks = 0;
            pcb.lastack = ackno;

            if !matches!(pcb.state, State::SynSent | State::SynReceived) {
                let mss = pcb.mss as u32;
                if pcb.cwnd < pcb.ssthresh {
                    pcb.cwnd = pcb.cwnd.saturating_add(mss);
                    tracing::trace!("{id}: slow start cwnd {}", pcb.cwnd);
                } else {
                    pcb.cwnd = pcb.cwnd.saturating_add(mss * mss / pcb.cwnd.max(1));
                    tracing::trace!("{id}: congestion avoidance cwnd {}", pcb.cwnd);
                }
            }

            pcb.snd_buf = (pcb.snd_buf + advanced as usize).min(max_buf);
            // SYN and FIN are not reported to the application
            acked = advanced.saturating_sub(pcb.retire(ackno));
            pcb.polltmr = 0;
        } else if seq_gt(ackno, pcb.snd_max) {
            tracing::debug!("{id}: ACK {ackno} for data never sent");
            pcb.ack_immediately();
        }

        pcb.sample_rtt(ackno, tx.ticks);
        Ok(acked)
    }

    /// Accepts the payload and FIN of `seg` if they are next in sequence.
    /// Returns the data for the application. Anything out of order is
    /// dropped and answered with an immediate ACK.
    pub fn data_arrived(&mut self, id: PcbId, seg: Arrival) -> Result<Option<Pbuf>, TcpError> {
        let pcb = self.get_mut(id)?;
        let Arrival {
            mut seqno,
            ctl,
            mut payload,
            ..
        } = seg;
        let fin = ctl.fin() as u32;
        let seg_len = payload.len() as u32 + fin;

        if seg_len == 0 {
            let wnd_edge = pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd);
            if seq_gt(pcb.rcv_nxt, seqno) || seq_geq(seqno, wnd_edge) {
                pcb.ack_immediately();
            }
            return Ok(None);
        }

        if seq_lt(seqno, pcb.rcv_nxt) {
            if seq_lt(pcb.rcv_nxt, seqno.wrapping_add(seg_len)) {
                let off = pcb.rcv_nxt.wrapping_sub(seqno) as usize;
                payload.remove_front(off.min(payload.len()));
                seqno = pcb.rcv_nxt;
            } else {
                tracing::trace!("{id}: duplicate segment {seqno}");
                pcb.ack_immediately();
                return Ok(None);
            }
        }

        let wnd_edge = pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd);
        if !(seq_geq(seqno, pcb.rcv_nxt) && seq_lt(seqno, wnd_edge)) {
            tracing::trace!("{id}: segment {seqno} outside the receive window");
            pcb.ack_immediately();
            return Ok(None);
        }
        if seqno != pcb.rcv_nxt {
            tracing::debug!(
                "{id}: out-of-order segment {seqno}, expected {}",
                pcb.rcv_nxt
            );
            pcb.ack_immediately();
            return Ok(None);
        }

        let len = payload.len() as u32 + fin;
        pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(len);
        pcb.rcv_wnd = pcb.rcv_wnd.saturating_sub(len);
        if fin > 0 {
            tracing::debug!("{id}: received FIN");
            pcb.flags.insert(PcbFlags::GOT_FIN);
        }
        if pcb.flags.contains(PcbFlags::ACK_DELAY) {
            pcb.ack_immediately();
        } else {
            pcb.flags.insert(PcbFlags::ACK_DELAY);
        }
        Ok((!payload.is_empty()).then_some(payload))
    }

    /// Applies the state changes that follow an in-sequence FIN from the peer
    /// or the acknowledgement of our own FIN.
    pub fn fin_arrived(&mut self, id: PcbId, fin_acked: bool) -> Result<(), TcpError> {
        let pcb = self.get_mut(id)?;
        let got_fin = pcb.flags.contains(PcbFlags::GOT_FIN);
        let state = pcb.state;
        match state {
            State::Established | State::SynReceived if got_fin => {
                pcb.ack_immediately();
                pcb.state = State::CloseWait;
            }
            State::FinWait1 if got_fin && fin_acked => {
                pcb.ack_immediately();
                self.enter_time_wait(id)?;
            }
            State::FinWait1 if got_fin => {
                pcb.ack_immediately();
                pcb.state = State::Closing;
            }
            State::FinWait1 if fin_acked => pcb.state = State::FinWait2,
            State::FinWait2 if got_fin => {
                pcb.ack_immediately();
                self.enter_time_wait(id)?;
            }
            State::Closing if fin_acked => self.enter_time_wait(id)?,
            State::LastAck if fin_acked => {
                tracing::debug!("{id}: connection closed");
                pcb.state = State::Closed;
                self.remove_pcb(id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Drops the connection if `seg` is an acceptable RST, reporting
    /// [`TcpError::Reset`] to the application.
    pub fn rst_arrived(&mut self, id: PcbId, seg: &Arrival) -> Result<(), TcpError> {
        let pcb = self.get_mut(id)?;
        let acceptable = if pcb.state == State::SynSent {
            seg.ackno == pcb.snd_nxt
        } else {
            seq_between(pcb.rcv_nxt, seg.seqno, pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd))
        };
        if !acceptable {
            tracing::debug!(
                "{id}: unacceptable reset seqno {} rcv_nxt {}",
                seg.seqno,
                pcb.rcv_nxt
            );
            return Ok(());
        }

        tracing::debug!("{id}: connection reset by peer");
        pcb.flags.remove(PcbFlags::ACK_DELAY);
        if let Some(mut pcb) = self.remove_pcb(id) {
            if let Some(mut callbacks) = pcb.callbacks.take() {
                callbacks.error(id, TcpError::Reset);
            }
        }
        Ok(())
    }

    fn listen_input(&mut self, listener: PcbId, seg: &Arrival) -> Result<(), TcpError> {
        if seg.ctl.rst() {
            return Ok(());
        }
        if seg.ctl.ack() {
            tracing::debug!("{listener}: ACK in LISTEN, sending reset");
            self.rst(
                seg.ackno,
                seg.seqno.wrapping_add(seg.tcp_len()),
                seg.endpoints,
            );
            return Ok(());
        }
        if seg.ctl.syn() {
            self.syn_arrived(listener, seg)?;
        }
        Ok(())
    }

    fn time_wait_input(&mut self, id: PcbId, seg: &Arrival) -> Result<(), TcpError> {
        let pcb = self.get_mut(id)?;
        let end = seg.seqno.wrapping_add(seg.tcp_len());
        if seq_gt(end, pcb.rcv_nxt) {
            pcb.rcv_nxt = end;
        }
        if seg.tcp_len() > 0 {
            pcb.ack_immediately();
        }
        self.output(id)
    }

    /// Runs the state machine for one segment. Returns `None` once the block
    /// is gone.
    fn process(&mut self, id: PcbId, seg: Arrival) -> Result<Option<Received>, TcpError> {
        let state = self.get(id)?.state;
        match state {
            State::SynSent => {
                self.syn_ack_arrived(id, &seg)?;
                return Ok(self.pcbs.contains_key(&id).then(Received::default));
            }
            State::SynReceived => {
                let pcb = self.get(id)?;
                let acceptable = seg.ctl.ack()
                    && seq_lt(pcb.lastack, seg.ackno)
                    && seq_leq(seg.ackno, pcb.snd_nxt);
                if !acceptable {
                    return Ok(Some(Received::default()));
                }
                if !self.accept(id)? {
                    return Ok(None);
                }
            }
            _ => {}
        }

        let acked = if seg.ctl.ack() {
            self.ack_arrived(id, &seg)?
        } else {
            0
        };
        let pcb = self.get(id)?;
        let fin_acked = seg.ctl.ack()
            && seg.ackno == pcb.snd_nxt
            && pcb.unsent.is_empty()
            && pcb.unacked.is_empty();
        let data = self.data_arrived(id, seg)?;
        if state == State::SynReceived {
            let pcb = self.get_mut(id)?;
            pcb.cwnd = initial_window(pcb.mss);
        }
        self.fin_arrived(id, fin_acked)?;

        if !self.pcbs.contains_key(&id) {
            return Ok(None);
        }
        Ok(Some(Received { acked, data }))
    }

    /// Moves a SYN_RCVD block to ESTABLISHED and offers it to its listener.
    /// Returns false if the connection was refused and aborted.
    fn accept(&mut self, id: PcbId) -> Result<bool, TcpError> {
        let pcb = self.get_mut(id)?;
        pcb.state = State::Established;
        let listener = pcb.listener;
        tracing::debug!("{id}: connection established");

        let taken = listener.and_then(|listener| {
            let callbacks = self.listeners.get_mut(&listener)?.callbacks.take()?;
            Some((listener, callbacks))
        });
        let result = match taken {
            Some((listener, mut callbacks)) => {
                let result = callbacks.accepted(self, listener, id);
                if let Some(listen_pcb) = self.listeners.get_mut(&listener) {
                    listen_pcb.callbacks.get_or_insert(callbacks);
                }
                result
            }
            // Nobody would ever hear of this connection
            None => Err(TcpError::Aborted),
        };

        match result {
            Ok(()) => Ok(self.pcbs.contains_key(&id)),
            Err(e) => {
                tracing::debug!("{id}: connection not accepted: {e}");
                if self.pcbs.contains_key(&id) {
                    self.abort(id)?;
                }
                Ok(false)
            }
        }
    }

    /// Tells the application what the segment brought, then sends whatever
    /// became sendable.
    fn notify(&mut self, id: PcbId, received: Received) -> Result<(), TcpError> {
        if received.acked > 0 {
            let sent = self.with_callbacks(id, |callbacks, stack| {
                callbacks.sent(stack, id, received.acked)
            });
            if let Some(Err(e)) = sent {
                tracing::debug!("{id}: sent callback failed: {e}");
                return Ok(());
            }
        }
        if let Some(data) = received.data {
            if !self.pcbs.contains_key(&id) {
                return Ok(());
            }
            if let Err(e) = self.upcall_received(id, Some(data)) {
                tracing::debug!("{id}: received callback failed: {e}");
                return Ok(());
            }
        }

        let got_fin = self
            .pcbs
            .get(&id)
            .map_or(false, |pcb| pcb.flags.contains(PcbFlags::GOT_FIN));
        if got_fin {
            if let Some(pcb) = self.pcbs.get_mut(&id) {
                pcb.flags.remove(PcbFlags::GOT_FIN);
            }
            if let Err(e) = self.upcall_received(id, None) {
                tracing::debug!("{id}: received callback failed at end of stream: {e}");
                return Ok(());
            }
        }

        if self.pcbs.contains_key(&id) {
            self.output(id)
        } else {
            Ok(())
        }
    }

    fn upcall_received(&mut self, id: PcbId, data: Option<Pbuf>) -> Result<(), TcpError> {
        if self.get(id)?.callbacks.is_some() {
            self.with_callbacks(id, |callbacks, stack| callbacks.received(stack, id, data))
                .unwrap_or(Ok(()))
        } else {
            Discard.received(self, id, data)
        }
    }
}

impl Pcb {
    /// Drops every queued segment that `ackno` covers. Returns the number of
    /// SYN and FIN octets among them.
    pub(super) fn retire(&mut self, ackno: u32) -> u32 {
        let mut control = 0;
        while self
            .unacked
            .front()
            .map_or(false, |seg| seq_leq(seg.end_seq(), ackno))
        {
            if let Some(seg) = self.unacked.pop_front() {
                control += seg.tcp_len() - seg.len() as u32;
                self.snd_queuelen = self.snd_queuelen.saturating_sub(seg.buffer_count());
            }
        }
        // After a retransmission, segments sent before may sit on unsent
        while self
            .unsent
            .front()
            .map_or(false, |seg| seq_leq(seg.end_seq(), ackno))
        {
            if let Some(seg) = self.unsent.pop_front() {
                control += seg.tcp_len() - seg.len() as u32;
                self.snd_queuelen = self.snd_queuelen.saturating_sub(seg.buffer_count());
            }
        }
        if seq_lt(self.snd_nxt, ackno) {
            self.snd_nxt = ackno;
        }
        control
    }

    /// Updates the smoothed RTT and its deviation if `ackno` covers the
    /// segment being timed (Jacobson, "Congestion Avoidance and Control").
    pub(super) fn sample_rtt(&mut self, ackno: u32, ticks: u32) {
        let rttest = match self.rttest {
            Some(rttest) if seq_lt(self.rtseq, ackno) => rttest,
            _ => return,
        };
        let mut m = ticks.wrapping_sub(rttest) as i32;
        m -= self.sa >> 3;
        self.sa += m;
        m = m.abs();
        m -= self.sv >> 2;
        self.sv += m;
        self.reset_rto();
        self.rttest = None;
        tracing::trace!(
            "{}: rtt {} ticks, rto {}",
            self.id,
            ticks.wrapping_sub(rttest),
            self.rto
        );
    }

    /// Requests an ACK on the next output, superseding a delayed one.
    fn ack_immediately(&mut self) {
        self.flags.remove(PcbFlags::ACK_DELAY);
        self.flags.insert(PcbFlags::ACK_NOW);
    }
}
