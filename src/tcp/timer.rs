//! The coarse and fine timers.
//!
//! [`TcpStack::slow_tmr`] runs every `slow_interval_ms` and drives
//! retransmission, connection timeouts, polling and TIME_WAIT expiry.
//! [`TcpStack::fast_tmr`] runs every `fast_interval_ms` and flushes delayed
//! ACKs.

use super::{pcb::PcbFlags, PcbId, PcbList, State, TcpError, TcpStack};

/// Multipliers applied to the base RTO on successive retransmissions.
const BACKOFF: [u32; 13] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];

impl TcpStack {
    /// One coarse timer tick.
    pub fn slow_tmr(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);

        for id in self.registry.snapshot(PcbList::Active) {
            match self.slow_tmr_pcb(id) {
                Ok(true) => self.expire(id),
                Ok(false) => {}
                Err(e) => tracing::debug!("{id}: slow timer: {e}"),
            }
        }

        let msl2 = self.config.ticks(2 * self.config.msl_ms);
        for id in self.registry.snapshot(PcbList::TimeWait) {
            let expired = self
                .pcbs
                .get(&id)
                .map_or(true, |pcb| self.ticks.wrapping_sub(pcb.tmr) > msl2);
            if expired {
                tracing::debug!("{id}: TIME_WAIT expired");
                self.registry.remove(id);
                self.pcbs.remove(&id);
            }
        }
    }

    /// One fine timer tick: every delayed ACK goes out now.
    pub fn fast_tmr(&mut self) {
        for id in self.registry.snapshot(PcbList::Active) {
            let delayed = self
                .pcbs
                .get(&id)
                .map_or(false, |pcb| pcb.flags.contains(PcbFlags::ACK_DELAY));
            if delayed {
                tracing::trace!("{id}: delayed ACK");
                if let Err(e) = self.ack_now(id) {
                    tracing::debug!("{id}: delayed ACK not sent: {e}");
                }
            }
        }
    }

    /// Runs the coarse timer for one active block. Returns true if the block
    /// has to go.
    fn slow_tmr_pcb(&mut self, id: PcbId) -> Result<bool, TcpError> {
        let (syn_max_rtx, max_rtx) = (self.config.syn_max_rtx, self.config.max_rtx);
        let fin_wait_timeout = self.config.ticks(self.config.fin_wait_timeout_ms);
        let syn_rcvd_timeout = self.config.ticks(self.config.syn_rcvd_timeout_ms);
        let ticks = self.ticks;

        let (pcb, mut tx) = self.split(id)?;
        if pcb.state == State::SynSent && pcb.nrtx >= syn_max_rtx {
            tracing::debug!("{id}: no answer to SYN after {} retransmissions", pcb.nrtx);
            return Ok(true);
        }
        if pcb.nrtx >= max_rtx {
            tracing::debug!("{id}: giving up after {} retransmissions", pcb.nrtx);
            return Ok(true);
        }

        pcb.rtime = pcb.rtime.saturating_add(1);
        if !pcb.unacked.is_empty() && pcb.rtime >= pcb.rto {
            if pcb.state != State::SynSent {
                let base = ((pcb.sa >> 3) + pcb.sv).max(1) as u32;
                let backoff = BACKOFF[(pcb.nrtx as usize).min(BACKOFF.len() - 1)];
                pcb.rto = base.saturating_mul(backoff);
            }
            let mss = pcb.mss as u32;
            pcb.ssthresh = (pcb.cwnd.min(pcb.snd_wnd) / 2).max(2 * mss);
            pcb.cwnd = mss;
            tracing::debug!(
                "{id}: retransmission timeout, rto {} cwnd {} ssthresh {}",
                pcb.rto,
                pcb.cwnd,
                pcb.ssthresh
            );
            tx.rexmit(pcb)?;
        }

        match pcb.state {
            State::FinWait2 if ticks.wrapping_sub(pcb.tmr) > fin_wait_timeout => {
                tracing::debug!("{id}: FIN_WAIT_2 timed out");
                return Ok(true);
            }
            State::SynReceived if ticks.wrapping_sub(pcb.tmr) > syn_rcvd_timeout => {
                tracing::debug!("{id}: SYN_RCVD timed out");
                return Ok(true);
            }
            _ => {}
        }

        pcb.polltmr = pcb.polltmr.saturating_add(1);
        if pcb.polltmr >= pcb.pollinterval && pcb.callbacks.is_some() {
            pcb.polltmr = 0;
            match self.with_callbacks(id, |callbacks, stack| callbacks.poll(stack, id)) {
                Some(Err(e)) => tracing::debug!("{id}: poll callback failed: {e}"),
                _ if self.pcbs.contains_key(&id) => self.output(id)?,
                _ => {}
            }
        }
        Ok(false)
    }

    /// Drops a block the slow timer gave up on. The peer gets no RST; the
    /// application sees [`TcpError::Aborted`].
    fn expire(&mut self, id: PcbId) {
        if let Some(mut pcb) = self.remove_pcb(id) {
            if let Some(mut callbacks) = pcb.callbacks.take() {
                callbacks.error(id, TcpError::Aborted);
            }
        }
    }
}

