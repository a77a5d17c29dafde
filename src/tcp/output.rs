//! The output engine and the segments sent outside the queues: pure ACKs and
//! resets.

use super::{
    pcb::{Pcb, PcbFlags},
    segment::Segment,
    seq::{seq_geq, seq_lt},
    tcp_parsing::{segment_checksum, set_checksum, TcpHeader, TcpHeaderBuilder},
    PcbId, State, TcpError, TcpStack, TcpStats,
};
use crate::{
    buffer::{Pbuf, PbufPool},
    config::TcpConfig,
    ip::{IpLayer, Netif, PROTO_TCP},
    logging::segment_event,
    utility::Endpoints,
};

impl TcpStack {
    /// Sends every queued segment the window admits, or a pure ACK if none is
    /// admitted and one is owed right now.
    pub fn output(&mut self, id: PcbId) -> Result<(), TcpError> {
        let (pcb, mut tx) = self.split(id)?;
        tx.output(pcb)
    }

    /// Sends a bare ACK for the current receive state, outside the queues.
    pub fn send_ack(&mut self, id: PcbId) -> Result<(), TcpError> {
        let (pcb, mut tx) = self.split(id)?;
        tx.send_ack(pcb)
    }

    /// Puts every unacknowledged segment back in front of the unsent queue and
    /// sends again whatever the window allows.
    pub fn rexmit(&mut self, id: PcbId) -> Result<(), TcpError> {
        let (pcb, mut tx) = self.split(id)?;
        tx.rexmit(pcb)
    }

    /// Sends a RST+ACK with the given numbers. Needs no connection block.
    pub fn rst(&mut self, seqno: u32, ackno: u32, endpoints: Endpoints) {
        self.tx().rst(seqno, ackno, endpoints);
    }
}

/// Everything the output path borrows from the stack besides the block
/// itself.
pub(super) struct Tx<'a> {
    pub ip: &'a mut Box<dyn IpLayer>,
    pub pool: &'a PbufPool,
    pub config: &'a TcpConfig,
    pub stats: &'a mut TcpStats,
    pub ticks: u32,
}

impl Tx<'_> {
    pub fn output(&mut self, pcb: &mut Pcb) -> Result<(), TcpError> {
        // The input path flushes once it is done with the segment
        if pcb.flags.contains(PcbFlags::IN_RECV) {
            return Ok(());
        }

        let wnd = pcb.effective_wnd();
        let mut admitted = false;
        while let Some(seg) = pcb.unsent.front() {
            let span = seg
                .seqno()
                .wrapping_sub(pcb.lastack)
                .wrapping_add(seg.len() as u32);
            if span > wnd {
                break;
            }
            let mut seg = match pcb.unsent.pop_front() {
                Some(seg) => seg,
                None => break,
            };
            admitted = true;
            pcb.rtime = 0;

            if pcb.state != State::SynSent {
                seg.header.ctl.set_ack(true);
                pcb.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
            }

            self.output_segment(pcb, &mut seg);
            pcb.snd_nxt = seg.end_seq();
            if seq_lt(pcb.snd_max, pcb.snd_nxt) {
                pcb.snd_max = pcb.snd_nxt;
            }

            if seg.tcp_len() > 0 {
                pcb.unacked.push_back(seg);
            } else {
                pcb.snd_queuelen = pcb.snd_queuelen.saturating_sub(seg.buffer_count());
            }
        }

        if !admitted
            && pcb.flags.contains(PcbFlags::ACK_NOW)
            && !pcb.flags.contains(PcbFlags::ACK_DELAY)
        {
            pcb.flags.remove(PcbFlags::ACK_DELAY | PcbFlags::ACK_NOW);
            match self.send_ack(pcb) {
                Err(e @ TcpError::OutOfMemory(_)) => return Err(e),
                Err(e) => tracing::debug!("{}: ACK not sent: {e}", pcb.id),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Hands one queued segment to IP, with the acknowledgement number and
    /// window filled in from the current state. Transmission problems are
    /// logged and counted; the retransmission timer recovers from them.
    fn output_segment(&mut self, pcb: &mut Pcb, seg: &mut Segment) {
        if seg.in_flight() {
            tracing::warn!(
                "{}: segment {} not transmitted, still in tx queue",
                pcb.id,
                seg.seqno()
            );
            return;
        }

        let netif = match self.route(pcb) {
            Some(netif) => netif,
            None => return,
        };

        pcb.rtime = 0;
        let rexmit = seq_lt(seg.seqno(), pcb.snd_max);
        // Retransmitted segments are never timed
        if pcb.rttest.is_none() && seq_geq(seg.seqno(), pcb.snd_max) {
            pcb.rttest = Some(self.ticks);
            pcb.rtseq = seg.seqno();
        }

        let header = TcpHeader {
            ack: if seg.ctl().ack() { pcb.rcv_nxt } else { 0 },
            wnd: pcb.advertised_wnd(),
            checksum: 0,
            ..seg.header
        };
        let mut bytes = header.serialize(&seg.options);
        if !self.checksum(&mut bytes, &seg.payload, pcb.endpoints, &netif) {
            return;
        }
        let chunk = match self.pool.copy_from(&bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.stats.memerr += 1;
                tracing::debug!("{}: no buffer for segment header: {e}", pcb.id);
                return;
            }
        };

        self.stats.xmit += 1;
        if rexmit {
            self.stats.rexmit += 1;
        }
        tracing::trace!(
            "{}: output_segment: {}:{}",
            pcb.id,
            seg.seqno(),
            seg.end_seq()
        );
        segment_event(
            pcb.endpoints,
            header.seq,
            header.ack,
            header.ctl,
            seg.len(),
            rexmit,
        );

        let mut packet = seg.payload.clone();
        packet.header(chunk.clone());
        seg.wire_header = Some(chunk);
        self.send(packet, pcb.endpoints, &netif);
    }

    /// Sends a bare ACK built from the current state of `pcb`.
    pub fn send_ack(&mut self, pcb: &mut Pcb) -> Result<(), TcpError> {
        let netif = self
            .route(pcb)
            .ok_or(TcpError::NoRoute(pcb.remote().address))?;
        let (header, _) = TcpHeaderBuilder::new(pcb.local().port, pcb.remote().port, pcb.snd_nxt)
            .ack(pcb.rcv_nxt)
            .wnd(pcb.advertised_wnd())
            .build()
            .map_err(|_| TcpError::InvalidArgument("bare ACK header"))?;
        let mut bytes = header.serialize(&[]);
        if !self.checksum(&mut bytes, &Pbuf::new(), pcb.endpoints, &netif) {
            return Err(TcpError::InvalidArgument("bare ACK checksum"));
        }
        let chunk = self.pool.copy_from(&bytes).map_err(|e| {
            self.stats.memerr += 1;
            TcpError::from(e)
        })?;

        self.stats.xmit += 1;
        segment_event(pcb.endpoints, header.seq, header.ack, header.ctl, 0, false);
        self.ip
            .output_if(
                Pbuf::from_chunk(chunk),
                pcb.local().address,
                pcb.remote().address,
                self.config.ttl,
                PROTO_TCP,
                &netif,
            )
            .map_err(|e| {
                tracing::debug!("{}: ACK not sent: {e}", pcb.id);
                TcpError::Ip(e)
            })
    }

    pub fn rexmit(&mut self, pcb: &mut Pcb) -> Result<(), TcpError> {
        if pcb.unacked.is_empty() {
            return Ok(());
        }

        let mut queue = std::mem::take(&mut pcb.unacked);
        queue.append(&mut pcb.unsent);
        pcb.unsent = queue;
        if let Some(first) = pcb.unsent.front() {
            pcb.snd_nxt = first.seqno();
        }
        pcb.nrtx = pcb.nrtx.saturating_add(1);
        pcb.rttest = None;
        tracing::debug!(
            "{}: retransmitting from {} (attempt {})",
            pcb.id,
            pcb.snd_nxt,
            pcb.nrtx
        );
        self.output(pcb)
    }

    /// Resends only the oldest unacknowledged segment, as fast retransmit
    /// does.
    pub fn rexmit_first(&mut self, pcb: &mut Pcb) {
        let (span, in_flight) = match pcb.unacked.front() {
            Some(seg) => (
                seg.seqno()
                    .wrapping_sub(pcb.lastack)
                    .wrapping_add(seg.len() as u32),
                seg.in_flight(),
            ),
            None => return,
        };
        let wnd = pcb.effective_wnd();
        if span > wnd {
            tracing::debug!(
                "{}: no room in window {wnd} to resend (ack {})",
                pcb.id,
                pcb.lastack
            );
            return;
        }
        if in_flight {
            tracing::debug!("{}: segment not resent, still in tx queue", pcb.id);
            return;
        }
        if let Some(mut seg) = pcb.unacked.pop_front() {
            pcb.nrtx = pcb.nrtx.saturating_add(1);
            self.output_segment(pcb, &mut seg);
            pcb.rttest = None;
            pcb.unacked.push_front(seg);
        }
    }

    /// Sends a RST+ACK that belongs to no connection block.
    pub fn rst(&mut self, seqno: u32, ackno: u32, endpoints: Endpoints) {
        let netif = match self.ip.route(endpoints.remote.address) {
            Some(netif) => netif,
            None => {
                self.stats.rterr += 1;
                tracing::debug!("rst: No route to {}", endpoints.remote.address);
                return;
            }
        };
        let built = TcpHeaderBuilder::new(endpoints.local.port, endpoints.remote.port, seqno)
            .ack(ackno)
            .rst()
            .build();
        let header = match built {
            Ok((header, _)) => header,
            Err(e) => {
                self.stats.err += 1;
                tracing::error!("rst: {e}");
                return;
            }
        };
        let mut bytes = header.serialize(&[]);
        if !self.checksum(&mut bytes, &Pbuf::new(), endpoints, &netif) {
            return;
        }
        let chunk = match self.pool.copy_from(&bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.stats.memerr += 1;
                tracing::debug!("rst: could not allocate header: {e}");
                return;
            }
        };

        self.stats.xmit += 1;
        segment_event(endpoints, seqno, ackno, header.ctl, 0, false);
        self.send(Pbuf::from_chunk(chunk), endpoints, &netif);
        tracing::debug!("rst: seqno {seqno} ackno {ackno}");
    }

    /// Finds the outgoing interface and fills in an unbound local address.
    fn route(&mut self, pcb: &mut Pcb) -> Option<Netif> {
        let remote = pcb.remote().address;
        match self.ip.route(remote) {
            Some(netif) => {
                if pcb.local().address.is_any() {
                    pcb.endpoints.local.address = netif.address;
                }
                Some(netif)
            }
            None => {
                self.stats.rterr += 1;
                tracing::debug!("{}: No route to {remote}", pcb.id);
                None
            }
        }
    }

    /// Writes the checksum into `header` unless the interface computes it.
    fn checksum(
        &mut self,
        header: &mut [u8],
        payload: &Pbuf,
        endpoints: Endpoints,
        netif: &Netif,
    ) -> bool {
        if netif.flags.tcp_tx_checksum_offload() {
            return true;
        }
        match segment_checksum(
            header,
            payload,
            endpoints.local.address,
            endpoints.remote.address,
        ) {
            Ok(checksum) => {
                set_checksum(header, checksum);
                true
            }
            Err(e) => {
                self.stats.err += 1;
                tracing::error!("checksum: {e}");
                false
            }
        }
    }

    fn send(&mut self, packet: Pbuf, endpoints: Endpoints, netif: &Netif) {
        let result = self.ip.output_if(
            packet,
            endpoints.local.address,
            endpoints.remote.address,
            self.config.ttl,
            PROTO_TCP,
            netif,
        );
        if let Err(e) = result {
            tracing::debug!("ip output to {} failed: {e}", endpoints.remote.address);
        }
    }
}
