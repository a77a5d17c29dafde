//! The segment queue builder: turns application data and control requests
//! into segments on a connection's unsent queue.

use super::{
    error::MemoryError,
    pcb::Pcb,
    segment::Segment,
    tcp_parsing::{Control, TcpHeaderBuilder},
    PcbId, TcpError, TcpStack,
};
use crate::{
    buffer::{Pbuf, PbufPool},
    config::TcpConfig,
};
use std::collections::VecDeque;

/// When [`TcpStack::write`] hands queued data to the output engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteMode {
    /// Transmit whatever the window allows right away.
    Flush,
    /// Transmit only if nothing is awaiting acknowledgement (RFC 896).
    #[default]
    Nagle,
    /// Only queue; the caller flushes with [`TcpStack::output`].
    NoFlush,
}

impl TcpStack {
    /// Queues `data` for sending. Writing is allowed while the connection is
    /// being set up, once it is established, and after the peer closed its
    /// side.
    pub fn write(&mut self, id: PcbId, data: &[u8], mode: WriteMode) -> Result<(), TcpError> {
        if self.listeners.contains_key(&id) {
            return Err(TcpError::NotConnected);
        }
        let state = self.get(id)?.state;
        if !state.can_send() {
            return Err(TcpError::NotConnected);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.enqueue(id, data, Control::empty(), &[])?;
        match mode {
            WriteMode::Flush => self.output(id),
            WriteMode::Nagle if self.get(id)?.unacked.is_empty() => self.output(id),
            WriteMode::Nagle | WriteMode::NoFlush => Ok(()),
        }
    }

    /// Queues a segment carrying only control bits, such as a FIN.
    pub fn send_ctrl(&mut self, id: PcbId, ctl: Control) -> Result<(), TcpError> {
        self.enqueue(id, &[], ctl, &[])
    }

    /// Queues `data`, `ctl` and `options` on the unsent queue of `id`.
    pub fn enqueue(
        &mut self,
        id: PcbId,
        data: &[u8],
        ctl: Control,
        options: &[u8],
    ) -> Result<(), TcpError> {
        let pcb = self.pcbs.get_mut(&id).ok_or(TcpError::UnknownPcb(id))?;
        let result = pcb.enqueue(&self.pool, &self.config, data, ctl, options);
        if let Err(TcpError::OutOfMemory(_)) = result {
            self.stats.memerr += 1;
        }
        result
    }
}

impl Pcb {
    pub(super) fn enqueue(
        &mut self,
        pool: &PbufPool,
        config: &TcpConfig,
        data: &[u8],
        ctl: Control,
        options: &[u8],
    ) -> Result<(), TcpError> {
        if data.len() > self.snd_buf {
            tracing::debug!("{}: enqueue: too much data {}", self.id, data.len());
            return Err(MemoryError::SendBuffer {
                requested: data.len(),
                available: self.snd_buf,
            }
            .into());
        }

        let max_queuelen = config.snd_queuelen();
        let mut queuelen = self.snd_queuelen;
        if queuelen >= max_queuelen {
            tracing::debug!(
                "{}: enqueue: too long queue {queuelen} (max {max_queuelen})",
                self.id
            );
            return Err(MemoryError::QueueLength {
                queued: queuelen,
                max: max_queuelen,
            }
            .into());
        }

        let mss = self.mss as usize;
        let plain = ctl.is_empty() && options.is_empty();

        // Bytes that fit into the spare room of the last unsent buffer
        let in_place = match self.unsent.back() {
            Some(last)
                if plain
                    && !last.ctl().is_syn_or_fin()
                    && last.options.is_empty()
                    && !last.in_flight() =>
            {
                mss.saturating_sub(last.len())
                    .min(last.payload.spare_capacity())
                    .min(data.len())
            }
            _ => 0,
        };

        // Build the new segments off to the side so that a failure leaves the
        // queue as it was.
        let mut seqno = self.snd_lbb.wrapping_add(in_place as u32);
        let mut left = &data[in_place..];
        let mut queue = VecDeque::new();
        while !left.is_empty() || (!plain && queue.is_empty()) {
            let seglen = left.len().min(mss);
            let (piece, rest) = left.split_at(seglen);

            let payload = if piece.is_empty() {
                Pbuf::new()
            } else {
                // Short trailing segments get room to grow up to the minimum
                // segment size
                let capacity = if seglen < mss {
                    seglen.max(mss.min(config.min_seg_size))
                } else {
                    seglen
                };
                let chunk = pool.copy_with_capacity(piece, capacity).map_err(|e| {
                    tracing::debug!("{}: enqueue: could not allocate {seglen} bytes", self.id);
                    e
                })?;
                Pbuf::from_chunk(chunk)
            };

            queuelen += 1;
            if queuelen > max_queuelen {
                tracing::debug!(
                    "{}: enqueue: queue too long {queuelen} ({max_queuelen})",
                    self.id
                );
                return Err(MemoryError::QueueLength {
                    queued: queuelen,
                    max: max_queuelen,
                }
                .into());
            }

            let (header, header_options) =
                TcpHeaderBuilder::new(self.local().port, self.remote().port, seqno)
                    .ctl(ctl)
                    .options(options)
                    .build()
                    .map_err(|_| {
                        TcpError::InvalidArgument("options must fill whole header words")
                    })?;
            tracing::trace!(
                "{}: enqueue: queueing {}:{} ({:?})",
                self.id,
                seqno,
                seqno.wrapping_add(seglen as u32),
                ctl
            );
            queue.push_back(Segment::new(header, header_options, payload));

            seqno = seqno.wrapping_add(seglen as u32);
            left = rest;
        }

        // Nothing below can fail.
        if in_place > 0 {
            if let Some(last) = self.unsent.back_mut() {
                let appended = last.payload.extend_in_place(&data[..in_place]);
                debug_assert_eq!(appended, in_place);
            }
        }

        let mergeable = match (self.unsent.back(), queue.front()) {
            (Some(last), Some(first)) => {
                last.tcp_len() != 0
                    && !last.ctl().is_syn_or_fin()
                    && !first.ctl().is_syn_or_fin()
                    && last.options.is_empty()
                    && first.options.is_empty()
                    && last.len() + first.len() <= mss
            }
            _ => false,
        };
        if mergeable {
            if let (Some(last), Some(first)) = (self.unsent.back_mut(), queue.pop_front()) {
                last.payload.chain(first.payload);
                tracing::trace!("{}: enqueue: chaining, new len {}", self.id, last.len());
            }
        }
        self.unsent.extend(queue);

        let len = data.len() + ctl.is_syn_or_fin() as usize;
        self.snd_lbb = self.snd_lbb.wrapping_add(len as u32);
        self.snd_buf = self.snd_buf.saturating_sub(len);
        self.snd_queuelen = queuelen;

        if !data.is_empty() {
            if let Some(last) = self.unsent.back_mut() {
                last.header.ctl.set_psh(true);
            }
        }
        Ok(())
    }
}
