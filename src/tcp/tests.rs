//! Two stacks talking over in-memory transmit queues.

use super::*;
use crate::{
    buffer::Pbuf,
    ip::{Datagram, Netif, TxQueue},
};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_test::traced_test;

const CLIENT_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const NETMASK: Ipv4Address = Ipv4Address::new([255, 255, 255, 0]);
const SERVER_PORT: u16 = 80;
const MSS: u32 = 536;

struct Host {
    stack: TcpStack,
    queue: TxQueue,
}

impl Host {
    fn new(address: Ipv4Address, config: TcpConfig) -> Self {
        let queue = TxQueue::new().with_netif(Netif::new("eth0", address, NETMASK));
        let stack = TcpStack::new(config, queue.clone(), PbufPool::unbounded());
        Self { stack, queue }
    }

    fn pcb(&self, id: PcbId) -> &Pcb {
        self.stack.pcb(id).unwrap()
    }

    fn pcb_mut(&mut self, id: PcbId) -> &mut Pcb {
        self.stack.pcb_mut(id).unwrap()
    }
}

fn config() -> TcpConfig {
    TcpConfig {
        snd_buf: 8192,
        wnd: 8192,
        iss_seed: Some(0x5eed),
        ..TcpConfig::default()
    }
}

fn header(datagram: &Datagram) -> TcpHeader {
    let bytes = datagram.payload.to_vec();
    TcpHeader::from_bytes(&bytes, datagram.src, datagram.dst)
        .unwrap()
        .header
}

fn payload_len(datagram: &Datagram) -> usize {
    datagram.payload.len() - header(datagram).bytes()
}

/// Delivers everything `from` has sent to `to`. Returns the number of
/// segments.
fn pump(from: &mut Host, to: &mut Host) -> usize {
    let datagrams = from.queue.drain();
    for datagram in &datagrams {
        to.stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    datagrams.len()
}

/// Pumps both ways, flushing delayed ACKs, until both sides fall silent.
fn settle(a: &mut Host, b: &mut Host) {
    for _ in 0..64 {
        if pump(a, b) + pump(b, a) == 0 {
            a.stack.fast_tmr();
            b.stack.fast_tmr();
            if a.queue.is_empty() && b.queue.is_empty() {
                return;
            }
        }
    }
    panic!("hosts never fell silent");
}

fn assert_contiguous(pcb: &Pcb) {
    let mut expected = pcb.lastack;
    for seg in pcb.unacked.iter().chain(pcb.unsent.iter()) {
        assert_eq!(seg.seqno(), expected);
        expected = seg.end_seq();
    }
    assert_eq!(expected, pcb.snd_lbb);
}

#[derive(Debug, Default)]
struct Events {
    accepted: Vec<PcbId>,
    connected: bool,
    data: Vec<u8>,
    eof: bool,
    sent: u32,
    polls: u32,
    errors: Vec<TcpError>,
}

#[derive(Debug, Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Events>>,
    /// Keeps received data in the window instead of reopening it
    hoard: bool,
}

impl Recorder {
    fn hoarding() -> Self {
        Self {
            hoard: true,
            ..Self::default()
        }
    }

    fn events(&self) -> MutexGuard<'_, Events> {
        self.events.lock().unwrap()
    }
}

impl Callbacks for Recorder {
    fn accepted(
        &mut self,
        stack: &mut TcpStack,
        _listener: PcbId,
        pcb: PcbId,
    ) -> Result<(), TcpError> {
        self.events().accepted.push(pcb);
        stack.set_callbacks(pcb, Box::new(self.clone()))
    }

    fn received(
        &mut self,
        stack: &mut TcpStack,
        pcb: PcbId,
        data: Option<Pbuf>,
    ) -> Result<(), TcpError> {
        match data {
            Some(data) => {
                self.events().data.extend(data.iter());
                if self.hoard {
                    Ok(())
                } else {
                    stack.recved(pcb, data.len() as u32)
                }
            }
            None => {
                self.events().eof = true;
                Ok(())
            }
        }
    }

    fn sent(&mut self, _stack: &mut TcpStack, _pcb: PcbId, len: u32) -> Result<(), TcpError> {
        self.events().sent += len;
        Ok(())
    }

    fn connected(&mut self, _stack: &mut TcpStack, _pcb: PcbId) -> Result<(), TcpError> {
        self.events().connected = true;
        Ok(())
    }

    fn poll(&mut self, _stack: &mut TcpStack, _pcb: PcbId) -> Result<(), TcpError> {
        self.events().polls += 1;
        Ok(())
    }

    fn error(&mut self, _pcb: PcbId, err: TcpError) {
        self.events().errors.push(err);
    }
}

struct Pair {
    client: Host,
    server: Host,
    /// The client's connection
    cid: PcbId,
    /// The server's side of the connection
    sid: PcbId,
    listener: PcbId,
    client_log: Recorder,
    server_log: Recorder,
}

fn listening_server(config: TcpConfig, log: &Recorder) -> (Host, PcbId) {
    let mut server = Host::new(SERVER_ADDRESS, config);
    let listener = server.stack.new_pcb();
    server
        .stack
        .set_callbacks(listener, Box::new(log.clone()))
        .unwrap();
    server
        .stack
        .bind(listener, Ipv4Address::ANY, SERVER_PORT)
        .unwrap();
    server.stack.listen(listener).unwrap();
    (server, listener)
}

fn connected_pair(client_config: TcpConfig, server_config: TcpConfig, server_log: Recorder) -> Pair {
    let (mut server, listener) = listening_server(server_config, &server_log);
    let mut client = Host::new(CLIENT_ADDRESS, client_config);
    let client_log = Recorder::default();
    let cid = client.stack.new_pcb();
    client
        .stack
        .set_callbacks(cid, Box::new(client_log.clone()))
        .unwrap();
    client
        .stack
        .connect(cid, SERVER_ADDRESS, SERVER_PORT)
        .unwrap();

    assert_eq!(pump(&mut client, &mut server), 1);
    assert_eq!(pump(&mut server, &mut client), 1);
    assert_eq!(pump(&mut client, &mut server), 1);
    let sid = server_log.events().accepted[0];
    assert_eq!(client.stack.state(cid), Some(State::Established));
    assert_eq!(server.stack.state(sid), Some(State::Established));

    Pair {
        client,
        server,
        cid,
        sid,
        listener,
        client_log,
        server_log,
    }
}

#[test]
fn three_way_handshake() {
    //     Client                                               Server
    // 1.  CLOSED                                               LISTEN
    // 2.  SYN-SENT    --> <SEQ=x><CTL=SYN><MSS=536>        --> SYN-RECEIVED
    // 3.  ESTABLISHED <-- <SEQ=y><ACK=x+1><CTL=SYN,ACK>    <-- SYN-RECEIVED
    // 4.  ESTABLISHED --> <SEQ=x+1><ACK=y+1><CTL=ACK>      --> ESTABLISHED

    // 1
    let server_log = Recorder::default();
    let (mut server, listener) = listening_server(config(), &server_log);
    let mut client = Host::new(CLIENT_ADDRESS, config());
    let client_log = Recorder::default();
    let cid = client.stack.new_pcb();
    client
        .stack
        .set_callbacks(cid, Box::new(client_log.clone()))
        .unwrap();

    // 2
    client
        .stack
        .connect(cid, SERVER_ADDRESS, SERVER_PORT)
        .unwrap();
    assert_eq!(client.stack.state(cid), Some(State::SynSent));
    let syn = client.queue.drain().remove(0);
    let syn_header = header(&syn);
    let bytes = syn.payload.to_vec();
    let parsed = TcpHeader::from_bytes(&bytes, syn.src, syn.dst).unwrap();
    assert_eq!(syn.src, CLIENT_ADDRESS);
    assert!(syn_header.ctl.syn());
    assert!(!syn_header.ctl.ack());
    assert_eq!(parsed.mss(), Some(536));
    let x = syn_header.seq;
    server.stack.input(&bytes, syn.src, syn.dst).unwrap();

    // 3
    let syn_ack = server.queue.drain().remove(0);
    let syn_ack_header = header(&syn_ack);
    assert!(syn_ack_header.ctl.syn());
    assert!(syn_ack_header.ctl.ack());
    assert_eq!(syn_ack_header.ack, x.wrapping_add(1));
    let y = syn_ack_header.seq;
    assert!(server_log.events().accepted.is_empty());
    client
        .stack
        .input(&syn_ack.payload.to_vec(), syn_ack.src, syn_ack.dst)
        .unwrap();
    assert_eq!(client.stack.state(cid), Some(State::Established));
    assert!(client_log.events().connected);

    // 4
    let ack = client.queue.drain().remove(0);
    let ack_header = header(&ack);
    assert_eq!(ack_header.seq, x.wrapping_add(1));
    assert_eq!(ack_header.ack, y.wrapping_add(1));
    assert_eq!(ack_header.ctl, Control::ACK);
    assert_eq!(payload_len(&ack), 0);
    server
        .stack
        .input(&ack.payload.to_vec(), ack.src, ack.dst)
        .unwrap();
    let sid = server_log.events().accepted[0];
    assert_eq!(server.stack.state(sid), Some(State::Established));
    assert_eq!(server.stack.pcb(sid).unwrap().listener, Some(listener));

    client.stack.check_registry().unwrap();
    server.stack.check_registry().unwrap();
    assert_eq!(server.stack.registry().which(listener), Some(PcbList::Listen));
    assert_eq!(server.stack.registry().which(sid), Some(PcbList::Active));
    assert_eq!(client.pcb(cid).cwnd, 4 * MSS);
    assert!(client.pcb(cid).unacked.is_empty());
    assert_eq!(client.pcb(cid).snd_queuelen, 0);
    // Both SYNs were charged a byte of send buffer and got it back
    assert_eq!(client.pcb(cid).snd_buf, 8192);
    assert_eq!(server.pcb(sid).snd_buf, 8192);
}

#[test]
fn nagle_holds_small_segment_while_data_is_unacknowledged() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;

    pair.client
        .stack
        .write(cid, &[1u8; 600], WriteMode::Nagle)
        .unwrap();
    let sent = pair.client.queue.drain();
    let lens: Vec<_> = sent.iter().map(payload_len).collect();
    assert_eq!(lens, vec![536, 64]);

    pair.client
        .stack
        .write(cid, &[2u8; 400], WriteMode::Nagle)
        .unwrap();
    assert!(pair.client.queue.is_empty());
    let pcb = pair.client.pcb(cid);
    assert_eq!(pcb.unacked.len(), 2);
    assert_eq!(pcb.unsent.len(), 1);
    assert_eq!(pcb.unsent[0].len(), 400);
    assert_contiguous(pcb);

    for datagram in &sent {
        pair.server
            .stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    drop(sent);
    settle(&mut pair.client, &mut pair.server);

    let mut expected = vec![1u8; 600];
    expected.extend([2u8; 400]);
    assert_eq!(pair.server_log.events().data, expected);
    assert_eq!(pair.client_log.events().sent, 1000);
    let pcb = pair.client.pcb(cid);
    assert!(pcb.unacked.is_empty() && pcb.unsent.is_empty());
    assert_eq!(pcb.snd_buf, 8192);
    assert_eq!(pcb.snd_queuelen, 0);
}

#[test]
fn byte_stream_survives_uneven_writes() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    let mut offset = 0;
    for size in [1, 7, 536, 535, 2, 1200, 64, 1000, 3, 1652] {
        pair.client
            .stack
            .write(cid, &data[offset..offset + size], WriteMode::NoFlush)
            .unwrap();
        offset += size;
        assert_contiguous(pair.client.pcb(cid));
        assert!(pair
            .client
            .pcb(cid)
            .unsent
            .iter()
            .all(|seg| seg.len() <= MSS as usize));
    }
    assert_eq!(offset, data.len());

    pair.client.stack.output(cid).unwrap();
    settle(&mut pair.client, &mut pair.server);
    assert_eq!(pair.server_log.events().data, data);
    assert_eq!(pair.client_log.events().sent, 5000);
}

#[test]
fn receive_window_bounds_sending() {
    // The server advertises 600 bytes and never reads
    let server_config = TcpConfig {
        wnd: 600,
        ..config()
    };
    let mut pair = connected_pair(config(), server_config, Recorder::hoarding());
    let (cid, sid) = (pair.cid, pair.sid);
    assert_eq!(pair.client.pcb(cid).snd_wnd, 600);

    pair.client
        .stack
        .write(cid, &[9u8; 600], WriteMode::Flush)
        .unwrap();
    pair.client
        .stack
        .write(cid, &[8u8; 100], WriteMode::Flush)
        .unwrap();
    let sent = pair.client.queue.drain();
    assert_eq!(sent.len(), 2);
    assert_eq!(pair.client.pcb(cid).unsent.len(), 1);

    // 64 bytes of window left is less than a segment: advertise nothing
    pair.server
        .stack
        .input(&sent[0].payload.to_vec(), sent[0].src, sent[0].dst)
        .unwrap();
    assert_eq!(pair.server.pcb(sid).rcv_wnd, 64);
    assert_eq!(pair.server.pcb(sid).advertised_wnd(), 0);
    assert!(pair.server.queue.is_empty());
    pair.server.stack.fast_tmr();
    let ack = pair.server.queue.drain().remove(0);
    assert_eq!(header(&ack).wnd, 0);
    assert_eq!(header(&ack).ack, header(&sent[1]).seq);

    pair.server
        .stack
        .input(&sent[1].payload.to_vec(), sent[1].src, sent[1].dst)
        .unwrap();
    drop(sent);
    pair.server.stack.fast_tmr();
    assert_eq!(pump(&mut pair.server, &mut pair.client), 1);
    pair.client
        .stack
        .input(&ack.payload.to_vec(), ack.src, ack.dst)
        .unwrap();
    assert_eq!(pair.client.pcb(cid).snd_wnd, 0);
    pair.client.stack.output(cid).unwrap();
    assert!(pair.client.queue.is_empty());

    // Reading reopens the window and releases the held segment
    pair.server.stack.recved(sid, 600).unwrap();
    pair.server.stack.fast_tmr();
    assert_eq!(pump(&mut pair.server, &mut pair.client), 1);
    let sent = pair.client.queue.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(payload_len(&sent[0]), 100);
}

#[test]
fn congestion_window_bounds_sending() {
    let mut pair = connected_pair(config(), config(), Recorder::hoarding());
    let cid = pair.cid;
    assert_eq!(pair.client.pcb(cid).snd_wnd, 8192);
    pair.client.pcb_mut(cid).cwnd = MSS;

    pair.client
        .stack
        .write(cid, &[5u8; 3 * MSS as usize], WriteMode::Flush)
        .unwrap();
    let sent = pair.client.queue.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(payload_len(&sent[0]), MSS as usize);
    let pcb = pair.client.pcb(cid);
    assert_eq!(pcb.unacked.len(), 1);
    assert_eq!(pcb.unsent.len(), 2);
    assert_contiguous(pcb);
}

#[test]
fn live_block_off_every_list_fails_the_check() {
    let mut host = Host::new(CLIENT_ADDRESS, config());
    let id = host.stack.new_pcb();
    host.stack.check_registry().unwrap();

    host.pcb_mut(id).state = State::Established;
    assert_eq!(
        host.stack.check_registry(),
        Err(RegistryError::Unlisted(id))
    );
    host.stack.registry.register(PcbList::Active, id);
    host.stack.check_registry().unwrap();

    let log = Recorder::default();
    let (mut server, listener) = listening_server(config(), &log);
    server.stack.check_registry().unwrap();
    server.stack.registry.remove(listener);
    assert_eq!(
        server.stack.check_registry(),
        Err(RegistryError::Unlisted(listener))
    );
}

#[test]
fn write_needs_a_sending_state() {
    let log = Recorder::default();
    let (mut server, listener) = listening_server(config(), &log);
    assert_eq!(
        server.stack.write(listener, b"hello", WriteMode::Flush),
        Err(TcpError::NotConnected)
    );

    let closed = server.stack.new_pcb();
    assert_eq!(
        server.stack.write(closed, b"hello", WriteMode::Flush),
        Err(TcpError::NotConnected)
    );
    assert!(server.queue.is_empty());

    let other = server.stack.new_pcb();
    assert_eq!(
        server.stack.bind(other, SERVER_ADDRESS, SERVER_PORT),
        Err(TcpError::AddressInUse(SERVER_PORT))
    );
}

#[test]
fn empty_ephemeral_range_refuses_to_connect() {
    let mut host = Host::new(
        CLIENT_ADDRESS,
        TcpConfig {
            first_port: 50000,
            last_port: 49999,
            ..config()
        },
    );
    let id = host.stack.new_pcb();
    assert_eq!(
        host.stack.connect(id, SERVER_ADDRESS, SERVER_PORT),
        Err(TcpError::InvalidArgument("ephemeral port range is empty"))
    );
    assert_eq!(
        host.stack.bind(id, CLIENT_ADDRESS, 0),
        Err(TcpError::InvalidArgument("ephemeral port range is empty"))
    );
    assert!(host.queue.is_empty());
    assert_eq!(host.stack.state(id), Some(State::Closed));
}

#[test]
fn oversized_write_is_refused_whole() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    pair.client
        .stack
        .write(cid, &[1u8; 100], WriteMode::NoFlush)
        .unwrap();
    let before = pair.client.pcb(cid).snd_lbb;

    let err = pair
        .client
        .stack
        .write(cid, &[2u8; 8192], WriteMode::Flush)
        .unwrap_err();
    assert_eq!(
        err,
        TcpError::OutOfMemory(MemoryError::SendBuffer {
            requested: 8192,
            available: 8092,
        })
    );
    let pcb = pair.client.pcb(cid);
    assert_eq!(pcb.snd_lbb, before);
    assert_eq!(pcb.unsent.len(), 1);
    assert_eq!(pcb.unsent[0].len(), 100);
    assert_eq!(pair.client.stack.stats().memerr, 1);
    assert!(pair.client.queue.is_empty());
}

#[test]
fn rexmit_splices_unacked_before_unsent() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    let stats = pair.client.stack.stats();

    pair.client
        .stack
        .write(cid, &[5u8; 1200], WriteMode::NoFlush)
        .unwrap();
    pair.client.pcb_mut(cid).snd_wnd = 2 * MSS;
    pair.client.stack.output(cid).unwrap();
    assert_eq!(pair.client.queue.len(), 2);
    pair.client.queue.flush();

    let lastack = pair.client.pcb(cid).lastack;
    assert_eq!(pair.client.pcb(cid).rtseq, lastack);
    pair.client.pcb_mut(cid).snd_wnd = 0;
    pair.client.stack.rexmit(cid).unwrap();

    let pcb = pair.client.pcb(cid);
    assert!(pcb.unacked.is_empty());
    let seqs: Vec<_> = pcb.unsent.iter().map(Segment::seqno).collect();
    assert_eq!(seqs, vec![lastack, lastack + MSS, lastack + 2 * MSS]);
    assert_eq!(pcb.snd_nxt, lastack);
    assert_eq!(pcb.nrtx, 1);
    assert_eq!(pcb.rttest, None);
    assert_contiguous(pcb);

    pair.client.pcb_mut(cid).snd_wnd = 8192;
    pair.client.stack.output(cid).unwrap();
    assert_eq!(pair.client.queue.len(), 3);
    let now = pair.client.stack.stats();
    assert_eq!(now.xmit - stats.xmit, 5);
    assert_eq!(now.rexmit - stats.rexmit, 2);
    // Only the segment never sent before is timed
    let pcb = pair.client.pcb(cid);
    assert!(pcb.rttest.is_some());
    assert_eq!(pcb.rtseq, lastack + 2 * MSS);

    settle(&mut pair.client, &mut pair.server);
    assert_eq!(pair.server_log.events().data, vec![5u8; 1200]);
}

#[test]
fn rexmit_with_nothing_unacked_is_a_no_op() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    pair.client.stack.rexmit(pair.cid).unwrap();
    assert_eq!(pair.client.pcb(pair.cid).nrtx, 0);
    assert!(pair.client.queue.is_empty());
}

#[test]
fn segment_still_queued_below_is_not_sent_again() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    pair.client
        .stack
        .write(cid, b"still on the wire", WriteMode::Flush)
        .unwrap();
    assert_eq!(pair.client.queue.len(), 1);
    let xmit = pair.client.stack.stats().xmit;

    // The datagram has not left the transmit queue yet
    pair.client.stack.rexmit(cid).unwrap();
    assert_eq!(pair.client.stack.stats().xmit, xmit);
    assert_eq!(pair.client.queue.len(), 1);
    assert_eq!(pair.client.pcb(cid).unacked.len(), 1);

    pair.client.queue.flush();
    pair.client.stack.rexmit(cid).unwrap();
    assert_eq!(pair.client.stack.stats().xmit, xmit + 1);
    assert_eq!(pair.client.queue.len(), 1);
}

#[test]
fn three_duplicate_acks_trigger_fast_retransmit() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    pair.client.pcb_mut(cid).cwnd = 8192;
    pair.client
        .stack
        .write(cid, &[3u8; 5 * MSS as usize], WriteMode::Flush)
        .unwrap();
    let mut sent = pair.client.queue.drain();
    assert_eq!(sent.len(), 5);
    let lost = sent.remove(0);
    drop(lost);

    // Every segment after the gap is answered at once with the same ACK
    for datagram in &sent {
        pair.server
            .stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    drop(sent);
    assert_eq!(pump(&mut pair.server, &mut pair.client), 4);

    let pcb = pair.client.pcb(cid);
    assert_eq!(pcb.dupacks, 3);
    assert!(pcb.flags.contains(PcbFlags::INFR));
    assert_eq!(pcb.ssthresh, 5 * MSS / 2);
    assert_eq!(pcb.cwnd, pcb.ssthresh + 3 * MSS);
    assert_eq!(pair.client.stack.stats().rexmit, 1);
    let resent = pair.client.queue.drain();
    assert_eq!(resent.len(), 1);
    assert_eq!(header(&resent[0]).seq, pcb.lastack);

    for datagram in &resent {
        pair.server
            .stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    drop(resent);
    pair.server.stack.fast_tmr();
    assert_eq!(pump(&mut pair.server, &mut pair.client), 1);
    let pcb = pair.client.pcb(cid);
    assert!(!pcb.flags.contains(PcbFlags::INFR));
    assert_eq!(pcb.dupacks, 0);
    assert!(pcb.cwnd >= pcb.ssthresh);
    assert_eq!(pair.server_log.events().data.len(), MSS as usize);
}

#[test]
fn retransmission_timeout_backs_off() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    pair.client
        .stack
        .write(cid, &[4u8; 100], WriteMode::Flush)
        .unwrap();
    let first = header(&pair.client.queue.drain()[0]);
    let cwnd = pair.client.pcb(cid).cwnd;
    let snd_wnd = pair.client.pcb(cid).snd_wnd;

    for _ in 0..20 {
        if pair.client.stack.stats().rexmit > 0 {
            break;
        }
        pair.client.stack.slow_tmr();
    }
    let pcb = pair.client.pcb(cid);
    assert_eq!(pair.client.stack.stats().rexmit, 1);
    assert_eq!(pcb.nrtx, 1);
    assert_eq!(pcb.cwnd, MSS);
    assert_eq!(pcb.ssthresh, (cwnd.min(snd_wnd) / 2).max(2 * MSS));
    let base = pcb.rto;
    let resent = pair.client.queue.drain();
    assert_eq!(header(&resent[0]).seq, first.seq);
    drop(resent);

    for _ in 0..40 {
        if pair.client.stack.stats().rexmit > 1 {
            break;
        }
        pair.client.stack.slow_tmr();
    }
    assert_eq!(pair.client.stack.stats().rexmit, 2);
    assert_eq!(pair.client.pcb(cid).rto, 2 * base);
    assert_eq!(pair.client.pcb(cid).nrtx, 2);

    settle(&mut pair.client, &mut pair.server);
    assert_eq!(pair.server_log.events().data, vec![4u8; 100]);
    assert_eq!(pair.client.pcb(cid).nrtx, 0);
    assert!(pair.client_log.events().polls > 0);
}

#[test]
fn unanswered_syn_gives_up_without_reset() {
    let mut client = Host::new(CLIENT_ADDRESS, config());
    let log = Recorder::default();
    let cid = client.stack.new_pcb();
    client.stack.set_callbacks(cid, Box::new(log.clone())).unwrap();
    client
        .stack
        .connect(cid, SERVER_ADDRESS, SERVER_PORT)
        .unwrap();

    let mut syns = 0;
    for _ in 0..200 {
        for datagram in client.queue.drain() {
            let header = header(&datagram);
            assert!(header.ctl.syn());
            assert!(!header.ctl.rst());
            syns += 1;
        }
        if client.stack.state(cid).is_none() {
            break;
        }
        client.stack.slow_tmr();
    }
    assert_eq!(client.stack.state(cid), None);
    assert_eq!(syns, 1 + client.stack.config().syn_max_rtx as usize);
    assert_eq!(log.events().errors, vec![TcpError::Aborted]);
    assert_eq!(client.stack.registry().len(PcbList::Active), 0);
    client.stack.check_registry().unwrap();
}

#[test]
fn delayed_ack_waits_for_fast_timer() {
    let mut pair = connected_pair(config(), config(), Recorder::hoarding());
    pair.client
        .stack
        .write(pair.cid, b"ping", WriteMode::Flush)
        .unwrap();
    assert_eq!(pump(&mut pair.client, &mut pair.server), 1);
    assert!(pair.server.queue.is_empty());
    assert!(pair
        .server
        .pcb(pair.sid)
        .flags
        .contains(PcbFlags::ACK_DELAY));

    pair.server.stack.fast_tmr();
    let ack = pair.server.queue.drain();
    assert_eq!(ack.len(), 1);
    assert_eq!(header(&ack[0]).ack, pair.client.pcb(pair.cid).snd_nxt);
    assert!(pair.server.pcb(pair.sid).flags.is_empty());
}

#[test]
fn orderly_close_passes_through_time_wait() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let (cid, sid) = (pair.cid, pair.sid);

    pair.client.stack.close(cid).unwrap();
    assert_eq!(pair.client.stack.state(cid), Some(State::FinWait1));
    let fin = pair.client.queue.drain();
    assert!(header(&fin[0]).ctl.fin());
    for datagram in &fin {
        pair.server
            .stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    drop(fin);
    assert_eq!(pair.server.stack.state(sid), Some(State::CloseWait));
    assert!(pair.server_log.events().eof);

    assert_eq!(pump(&mut pair.server, &mut pair.client), 1);
    assert_eq!(pair.client.stack.state(cid), Some(State::FinWait2));
    assert_eq!(pair.client_log.events().sent, 0);

    pair.server.stack.close(sid).unwrap();
    assert_eq!(pair.server.stack.state(sid), Some(State::LastAck));
    assert_eq!(pump(&mut pair.server, &mut pair.client), 1);
    assert_eq!(pair.client.stack.state(cid), Some(State::TimeWait));
    assert!(pair.client_log.events().eof);
    assert_eq!(
        pair.client.stack.registry().which(cid),
        Some(PcbList::TimeWait)
    );

    assert_eq!(pump(&mut pair.client, &mut pair.server), 1);
    assert_eq!(pair.server.stack.state(sid), None);
    assert_eq!(pair.server.stack.registry().which(sid), None);
    assert_eq!(
        pair.server.stack.registry().which(pair.listener),
        Some(PcbList::Listen)
    );
    pair.client.stack.check_registry().unwrap();
    pair.server.stack.check_registry().unwrap();

    let two_msl = pair.client.stack.config().ticks(2 * pair.client.stack.config().msl_ms);
    for _ in 0..two_msl {
        pair.client.stack.slow_tmr();
    }
    assert_eq!(pair.client.stack.state(cid), Some(State::TimeWait));
    pair.client.stack.slow_tmr();
    assert_eq!(pair.client.stack.state(cid), None);
    assert_eq!(pair.client.stack.registry().len(PcbList::TimeWait), 0);
    assert!(pair.client_log.events().errors.is_empty());
}

#[test]
fn fin_wait_2_times_out() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let cid = pair.cid;
    pair.client.stack.close(cid).unwrap();
    settle(&mut pair.client, &mut pair.server);
    assert_eq!(pair.client.stack.state(cid), Some(State::FinWait2));

    let timeout = pair
        .client
        .stack
        .config()
        .ticks(pair.client.stack.config().fin_wait_timeout_ms);
    for _ in 0..=timeout {
        pair.client.stack.slow_tmr();
    }
    assert_eq!(pair.client.stack.state(cid), None);
    assert_eq!(pair.client_log.events().errors, vec![TcpError::Aborted]);
}

#[test]
#[traced_test]
fn connecting_to_a_closed_port_is_reset() {
    let log = Recorder::default();
    let (mut server, _listener) = listening_server(config(), &log);
    let mut client = Host::new(CLIENT_ADDRESS, config());
    let client_log = Recorder::default();
    let cid = client.stack.new_pcb();
    client
        .stack
        .set_callbacks(cid, Box::new(client_log.clone()))
        .unwrap();
    client
        .stack
        .connect(cid, SERVER_ADDRESS, SERVER_PORT + 1)
        .unwrap();
    let iss = client.pcb(cid).lastack;

    assert_eq!(pump(&mut client, &mut server), 1);
    let rst = server.queue.drain();
    let rst_header = header(&rst[0]);
    assert_eq!(rst_header.ctl, Control::RST | Control::ACK);
    assert_eq!(rst_header.ack, iss.wrapping_add(1));
    assert!(logs_contain("rst: seqno"));

    for datagram in &rst {
        client
            .stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    assert_eq!(client.stack.state(cid), None);
    assert_eq!(client_log.events().errors, vec![TcpError::Reset]);
}

#[test]
fn abort_resets_the_peer() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    pair.client.stack.abort(pair.cid).unwrap();
    assert_eq!(pair.client.stack.state(pair.cid), None);
    assert_eq!(pair.client_log.events().errors, vec![TcpError::Aborted]);

    let rst = pair.client.queue.drain();
    assert_eq!(rst.len(), 1);
    assert!(header(&rst[0]).ctl.rst());
    for datagram in &rst {
        pair.server
            .stack
            .input(&datagram.payload.to_vec(), datagram.src, datagram.dst)
            .unwrap();
    }
    assert_eq!(pair.server.stack.state(pair.sid), None);
    assert_eq!(pair.server_log.events().errors, vec![TcpError::Reset]);
    pair.server.stack.check_registry().unwrap();
}

#[test]
fn unacceptable_reset_is_ignored() {
    let mut pair = connected_pair(config(), config(), Recorder::default());
    let pcb = pair.server.pcb(pair.sid);
    let endpoints = pcb.endpoints.reverse();
    let far_away = pcb.rcv_nxt.wrapping_add(pcb.rcv_wnd).wrapping_add(1000);
    pair.client.stack.rst(far_away, 0, endpoints);
    pump(&mut pair.client, &mut pair.server);
    assert_eq!(pair.server.stack.state(pair.sid), Some(State::Established));
    assert!(pair.server_log.events().errors.is_empty());
}

#[test]
fn listener_answers_stray_ack_with_reset() {
    let log = Recorder::default();
    let (mut server, _listener) = listening_server(config(), &log);
    let mut client = Host::new(CLIENT_ADDRESS, config());
    let endpoints = Endpoints::new(
        Endpoint::new(CLIENT_ADDRESS, 5000),
        Endpoint::new(SERVER_ADDRESS, SERVER_PORT),
    );
    client.stack.send_stray_ack(endpoints, 77, 1234);
    assert_eq!(pump(&mut client, &mut server), 1);

    let rst = server.queue.drain();
    assert_eq!(rst.len(), 1);
    let rst_header = header(&rst[0]);
    assert!(rst_header.ctl.rst());
    assert_eq!(rst_header.seq, 1234);
    assert!(log.events().accepted.is_empty());
}

#[test]
fn listener_without_callbacks_refuses_connections() {
    let mut server = Host::new(SERVER_ADDRESS, config());
    let listener = server.stack.new_pcb();
    server.stack.bind(listener, SERVER_ADDRESS, SERVER_PORT).unwrap();
    server.stack.listen(listener).unwrap();
    let mut client = Host::new(CLIENT_ADDRESS, config());
    let cid = client.stack.new_pcb();
    client
        .stack
        .connect(cid, SERVER_ADDRESS, SERVER_PORT)
        .unwrap();

    assert_eq!(pump(&mut client, &mut server), 1);
    assert_eq!(pump(&mut server, &mut client), 1);
    // The final ACK of the handshake finds nobody to accept the connection
    assert_eq!(pump(&mut client, &mut server), 1);
    assert_eq!(server.stack.registry().len(PcbList::Active), 0);
    assert_eq!(pump(&mut server, &mut client), 1);
    assert_eq!(client.stack.state(cid), None);
}

impl TcpStack {
    /// Sends a bare ACK that belongs to no connection.
    fn send_stray_ack(&mut self, endpoints: Endpoints, seqno: u32, ackno: u32) {
        let (header, _) = TcpHeaderBuilder::new(endpoints.local.port, endpoints.remote.port, seqno)
            .ack(ackno)
            .wnd(1000)
            .build()
            .unwrap();
        let mut bytes = header.serialize(&[]);
        let checksum = tcp_parsing::segment_checksum(
            &bytes,
            &Pbuf::new(),
            endpoints.local.address,
            endpoints.remote.address,
        )
        .unwrap();
        tcp_parsing::set_checksum(&mut bytes, checksum);
        let netif = self.ip.route(endpoints.remote.address).unwrap();
        let packet = Pbuf::from_chunk(self.pool.copy_from(&bytes).unwrap());
        self.ip
            .output_if(
                packet,
                endpoints.local.address,
                endpoints.remote.address,
                64,
                crate::ip::PROTO_TCP,
                &netif,
            )
            .unwrap();
    }
}
