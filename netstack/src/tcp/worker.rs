//! Per-socket TCP state machine, sender loops, and blocking I/O (§4.5).
//!
//! The `st`/`criticalSt` rendezvous is preserved faithfully: `st` is the
//! last-committed stable state, `criticalSt` is `None` (the `INVAL`
//! sentinel) while a transition is in flight and `Some(state)` once it
//! settles. The inbound handler claims the transition at entry and commits
//! it at exit; public operations (`accept`, `connect`, `close`) wait for
//! `criticalSt` to settle to a state they care about.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::config::StackConfig;
use crate::error::{Errno, SockResult};
use crate::ipv4::{IpEngine, IPPROTO_TCP};
use crate::tcp::buffer::RecvBuffer;
use crate::tcp::segment::{TcpFlags, TcpSegment};
use crate::tcp::seq::SequenceSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimedWait,
}

/// The `st`/`criticalSt` pair plus their two condition variables.
struct StateCell {
    st: Mutex<TcpState>,
    /// `None` is the `INVAL` sentinel: a transition is in flight.
    critical: Mutex<Option<TcpState>>,
    same_cv: Condvar,
    change_cv: Condvar,
}

impl StateCell {
    fn new(initial: TcpState) -> Self {
        Self {
            st: Mutex::new(initial),
            critical: Mutex::new(Some(initial)),
            same_cv: Condvar::new(),
            change_cv: Condvar::new(),
        }
    }

    fn current(&self) -> TcpState {
        *self.st.lock().unwrap()
    }

    /// Waits for `st == criticalSt` (no transition in flight), then claims
    /// it by setting `criticalSt = INVAL`. Returns the claimed stable state.
    fn begin_transition(&self) -> TcpState {
        let mut critical = self.critical.lock().unwrap();
        loop {
            if let Some(s) = *critical {
                if s == *self.st.lock().unwrap() {
                    *critical = None;
                    return s;
                }
            }
            critical = self.same_cv.wait(critical).unwrap();
        }
    }

    /// Commits a new stable state, settling `criticalSt` to it and waking
    /// both the handler's own rendezvous and any public operation waiting
    /// for this particular state.
    fn commit(&self, new_st: TcpState) {
        *self.st.lock().unwrap() = new_st;
        *self.critical.lock().unwrap() = Some(new_st);
        self.same_cv.notify_all();
        self.change_cv.notify_all();
    }

    /// Used by public operations (`connect`, `accept`, `close`) to force an
    /// eager transition, the same way the handler's `setSt` does for the
    /// ESTABLISHED/CLOSE_WAIT/CLOSING rows of the state table.
    fn set_eager(&self, new_st: TcpState) {
        self.commit(new_st);
    }

    fn wait_until(&self, target: TcpState, closed: &AtomicBool) -> bool {
        let mut critical = self.critical.lock().unwrap();
        loop {
            if *critical == Some(target) {
                return true;
            }
            if closed.load(Ordering::Acquire) {
                return false;
            }
            critical = self.change_cv.wait(critical).unwrap();
        }
    }
}

struct SendItem {
    seq: u32,
    wire: Vec<u8>,
}

pub struct TcpWorker {
    pub local: Mutex<Option<SocketAddrV4>>,
    pub remote: Mutex<Option<SocketAddrV4>>,
    pub seq: SequenceSet,
    state: StateCell,

    send_list: Mutex<VecDeque<SendItem>>,
    seq_cv: Condvar,
    send_nonblock_list: Mutex<VecDeque<Vec<u8>>>,
    nonblock_cv: Condvar,

    recv_buf: Mutex<RecvBuffer>,
    recv_cv: Condvar,
    peer_fin: AtomicBool,

    pendings: Mutex<VecDeque<(SocketAddrV4, u32)>>,
    accept_cv: Condvar,
    backlog: usize,

    abandoned: Mutex<HashSet<u32>>,
    last_dup_ack: Mutex<Option<Instant>>,

    closed: AtomicBool,
    ip: Arc<IpEngine>,
    config: Arc<StackConfig>,
}

impl TcpWorker {
    pub fn new(ip: Arc<IpEngine>, config: Arc<StackConfig>, isn: u32, backlog: usize) -> Arc<Self> {
        Arc::new(Self {
            local: Mutex::new(None),
            remote: Mutex::new(None),
            seq: SequenceSet::new(isn),
            state: StateCell::new(TcpState::Closed),
            send_list: Mutex::new(VecDeque::new()),
            seq_cv: Condvar::new(),
            send_nonblock_list: Mutex::new(VecDeque::new()),
            nonblock_cv: Condvar::new(),
            recv_buf: Mutex::new(RecvBuffer::new()),
            recv_cv: Condvar::new(),
            peer_fin: AtomicBool::new(false),
            pendings: Mutex::new(VecDeque::new()),
            accept_cv: Condvar::new(),
            backlog: backlog.max(1),
            abandoned: Mutex::new(HashSet::new()),
            last_dup_ack: Mutex::new(None),
            closed: AtomicBool::new(false),
            ip,
            config,
        })
    }

    pub fn state(&self) -> TcpState {
        self.state.current()
    }

    pub fn set_addrs(&self, local: SocketAddrV4, remote: Option<SocketAddrV4>) {
        *self.local.lock().unwrap() = Some(local);
        *self.remote.lock().unwrap() = remote;
    }

    pub fn addrs(&self) -> (Option<SocketAddrV4>, Option<SocketAddrV4>) {
        (*self.local.lock().unwrap(), *self.remote.lock().unwrap())
    }

    fn encode(&self, local: SocketAddrV4, remote: SocketAddrV4, seq: u32, ack: Option<u32>, flags: TcpFlags, data: Vec<u8>) -> Vec<u8> {
        let mut flags = flags;
        let ack_val = ack.unwrap_or(0);
        if ack.is_some() {
            flags.insert(TcpFlags::ACK);
        }
        TcpSegment::new(local.port(), remote.port(), seq, ack_val, flags).with_data(data).encode(*local.ip(), *remote.ip())
    }

    fn transmit(&self, wire: &[u8], local: SocketAddrV4, remote: SocketAddrV4) {
        if let Err(e) = self.ip.send_ip(*local.ip(), *remote.ip(), IPPROTO_TCP, wire, &self.config) {
            warn!("tcp: send to {remote} failed: {e}");
        }
    }

    fn addrs_or_drop(&self) -> Option<(SocketAddrV4, SocketAddrV4)> {
        match (*self.local.lock().unwrap(), *self.remote.lock().unwrap()) {
            (Some(l), Some(r)) => Some((l, r)),
            _ => None,
        }
    }

    /// Enqueues a pure ACK for `rcv_nxt` on the non-blocking queue.
    fn send_pure_ack(&self) {
        let Some((local, remote)) = self.addrs_or_drop() else { return };
        let wire = self.encode(local, remote, self.seq.snd_nxt(), Some(self.seq.rcv_nxt()), TcpFlags::empty(), Vec::new());
        self.send_nonblock_list.lock().unwrap().push_back(wire);
        self.nonblock_cv.notify_one();
    }

    fn maybe_send_dup_ack(&self) {
        let mut last = self.last_dup_ack.lock().unwrap();
        let now = Instant::now();
        let due = match *last {
            Some(t) => now.duration_since(t) >= self.config.dup_ack_min_interval,
            None => true,
        };
        if due {
            *last = Some(now);
            drop(last);
            self.send_pure_ack();
        }
    }

    /// Enqueues a reliable (blocking-sender-owned) segment and returns its
    /// assigned sequence number.
    fn enqueue_blocking(&self, local: SocketAddrV4, remote: SocketAddrV4, flags: TcpFlags, data: Vec<u8>) -> u32 {
        let len = if data.is_empty() {
            if flags.with_syn() || flags.with_fin() { 1 } else { 0 }
        } else {
            data.len() as u32
        };
        let seq = self.seq.allocate_with_len(len);
        let wire = self.encode(local, remote, seq, Some(self.seq.rcv_nxt()), flags, data);
        self.send_list.lock().unwrap().push_back(SendItem { seq, wire });
        self.seq_cv.notify_all();
        seq
    }

    fn is_new_ack(&self, ack: u32) -> bool {
        self.seq.snd_lt(self.seq.snd_una(), ack)
    }

    fn consume_ack(&self, ack: u32) {
        if self.is_new_ack(ack) {
            self.seq.set_snd_una(ack);
        }
        let mut list = self.send_list.lock().unwrap();
        while let Some(front) = list.front() {
            if self.seq.snd_lt(front.seq, ack) || front.seq == ack {
                list.pop_front();
            } else {
                break;
            }
        }
        drop(list);
        self.seq_cv.notify_all();
    }

    fn abandon_all_and_wake(&self) {
        self.closed.store(true, Ordering::Release);
        self.seq_cv.notify_all();
        self.nonblock_cv.notify_all();
        self.recv_cv.notify_all();
        self.accept_cv.notify_all();
    }

    // ---- Inbound handler (§4.5) ----

    /// The per-segment entry path. `local`/`remote` are the addresses this
    /// segment is framed against (already resolved by the socket demux).
    pub fn handle_segment(self: &Arc<Self>, seg: &TcpSegment, local: SocketAddrV4, remote: SocketAddrV4) {
        let current = self.state.begin_transition();
        if current == TcpState::Closed {
            self.state.commit(current);
            return;
        }

        self.set_addrs(local, Some(remote));

        let post_syn = !matches!(current, TcpState::Listen | TcpState::SynSent);
        if post_syn {
            let rcv_nxt = self.seq.rcv_nxt();
            if seg.seq != rcv_nxt {
                if self.seq.rcv_lt(rcv_nxt, seg.seq) {
                    trace!("tcp: out-of-order segment seq={} expected={}", seg.seq, rcv_nxt);
                    self.send_pure_ack();
                } else {
                    debug!("tcp: duplicate segment seq={} expected={}", seg.seq, rcv_nxt);
                    self.maybe_send_dup_ack();
                }
                self.state.commit(current);
                return;
            }
        }

        if seg.flags.with_rst() {
            debug!("tcp: RST received from {remote}, closing");
            self.state.commit(TcpState::Closed);
            self.abandon_all_and_wake();
            return;
        }

        let meaningful_ack = seg.flags.with_ack() && self.is_new_ack(seg.ack);

        let next = match current {
            TcpState::Listen if seg.flags.is_syn() => {
                self.seq.set_rcv_isn(seg.seq.wrapping_add(1));
                let mut pend = self.pendings.lock().unwrap();
                if pend.len() < self.backlog {
                    pend.push_back((remote, seg.seq));
                    self.accept_cv.notify_all();
                } else {
                    warn!("tcp: backlog full on {local}, dropping SYN from {remote}");
                }
                TcpState::Listen
            }
            TcpState::SynSent if seg.flags.is_syn_ack() && meaningful_ack => {
                self.seq.set_rcv_isn(seg.seq.wrapping_add(1));
                self.consume_ack(seg.ack);
                self.send_pure_ack();
                TcpState::Established
            }
            TcpState::SynSent if seg.flags.is_syn() => {
                self.seq.set_rcv_isn(seg.seq.wrapping_add(1));
                TcpState::SynReceived
            }
            TcpState::SynReceived if meaningful_ack => {
                self.consume_ack(seg.ack);
                TcpState::Established
            }
            TcpState::Established | TcpState::FinWait1 if seg.flags.is_fin() || seg.flags.is_fin_ack() => {
                if meaningful_ack {
                    self.consume_ack(seg.ack);
                }
                let ack = self.seq.snd_ack_with_len(1);
                self.send_pure_ack_for(local, remote, ack);
                if current == TcpState::Established {
                    self.peer_fin.store(true, Ordering::Release);
                    self.recv_cv.notify_all();
                    TcpState::CloseWait
                } else if seg.flags.is_fin_ack() && meaningful_ack {
                    TcpState::TimedWait
                } else {
                    self.peer_fin.store(true, Ordering::Release);
                    self.recv_cv.notify_all();
                    TcpState::Closing
                }
            }
            TcpState::Established if !seg.data.is_empty() => {
                if meaningful_ack {
                    self.consume_ack(seg.ack);
                }
                self.recv_buf.lock().unwrap().push(&seg.data, seg.flags.with_psh());
                self.recv_cv.notify_all();
                let ack = self.seq.snd_ack_with_len(seg.data.len() as u32);
                self.send_pure_ack_for(local, remote, ack);
                TcpState::Established
            }
            TcpState::Established if meaningful_ack => {
                self.consume_ack(seg.ack);
                TcpState::Established
            }
            TcpState::FinWait1 if !seg.data.is_empty() => {
                if meaningful_ack {
                    self.consume_ack(seg.ack);
                }
                self.recv_buf.lock().unwrap().push(&seg.data, seg.flags.with_psh());
                self.recv_cv.notify_all();
                let ack = self.seq.snd_ack_with_len(seg.data.len() as u32);
                self.send_pure_ack_for(local, remote, ack);
                TcpState::FinWait1
            }
            TcpState::FinWait1 if meaningful_ack => {
                self.consume_ack(seg.ack);
                TcpState::FinWait2
            }
            TcpState::FinWait2 if seg.flags.is_fin() => {
                let ack = self.seq.snd_ack_with_len(1);
                self.send_pure_ack_for(local, remote, ack);
                self.peer_fin.store(true, Ordering::Release);
                self.recv_cv.notify_all();
                TcpState::TimedWait
            }
            TcpState::Closing if meaningful_ack => {
                self.consume_ack(seg.ack);
                TcpState::TimedWait
            }
            TcpState::LastAck if meaningful_ack => {
                self.consume_ack(seg.ack);
                TcpState::Closed
            }
            other => other,
        };

        if next != current {
            debug!("tcp: {local} <-> {remote}: {current:?} -> {next:?}");
        }
        self.state.commit(next);
        if next == TcpState::Closed {
            self.abandon_all_and_wake();
        }
    }

    fn send_pure_ack_for(&self, local: SocketAddrV4, remote: SocketAddrV4, ack: u32) {
        let wire = self.encode(local, remote, self.seq.snd_nxt(), Some(ack), TcpFlags::empty(), Vec::new());
        self.send_nonblock_list.lock().unwrap().push_back(wire);
        self.nonblock_cv.notify_one();
    }

    // ---- Sender loops (§4.5) ----

    pub fn spawn_sender_loops(self: &Arc<Self>) {
        let blocking = self.clone();
        std::thread::spawn(move || blocking.blocking_sender_loop());
        let nonblock = self.clone();
        std::thread::spawn(move || nonblock.nonblocking_sender_loop());
    }

    fn blocking_sender_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let (local, remote) = match self.addrs_or_drop() {
                Some(a) => a,
                None => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
            };
            let mut list = self.send_list.lock().unwrap();
            while list.is_empty() && !self.closed.load(Ordering::Acquire) {
                list = self.seq_cv.wait(list).unwrap();
            }
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let curr_seq = list.front().unwrap().seq;
            let wire = list.front().unwrap().wire.clone();
            drop(list);

            let mut retries_left = self.config.tcp_max_retrans;
            loop {
                self.transmit(&wire, local, remote);
                let list = self.send_list.lock().unwrap();
                let (list, timeout) = self
                    .seq_cv
                    .wait_timeout_while(list, self.config.tcp_timeout, |l| {
                        !self.closed.load(Ordering::Acquire) && l.front().map(|f| f.seq) == Some(curr_seq)
                    })
                    .unwrap();
                let still_outstanding = list.front().map(|f| f.seq) == Some(curr_seq);
                drop(list);
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                if !still_outstanding {
                    break;
                }
                if timeout.timed_out() {
                    if retries_left == 0 {
                        warn!("tcp: abandoning seq {curr_seq} to {remote} after max retransmissions");
                        self.abandoned.lock().unwrap().insert(curr_seq);
                        self.send_list.lock().unwrap().pop_front();
                        self.seq_cv.notify_all();
                        break;
                    }
                    retries_left -= 1;
                    debug!("tcp: retransmitting seq {curr_seq} to {remote} ({retries_left} retries left)");
                } else {
                    break;
                }
            }
        }
    }

    fn nonblocking_sender_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let (local, remote) = match self.addrs_or_drop() {
                Some(a) => a,
                None => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
            };
            let mut list = self.send_nonblock_list.lock().unwrap();
            while list.is_empty() && !self.closed.load(Ordering::Acquire) {
                list = self.nonblock_cv.wait(list).unwrap();
            }
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let wire = list.pop_front().unwrap();
            drop(list);
            self.transmit(&wire, local, remote);
        }
    }

    // ---- Public operations (§4.5) ----

    pub fn listen(&self, backlog_hint: usize) {
        let _ = backlog_hint;
        self.state.set_eager(TcpState::Listen);
    }

    /// Blocks for an inbound SYN; returns the remote address and the peer's
    /// initial sequence number for the new child socket to seed.
    pub fn accept_pending(&self) -> Option<(SocketAddrV4, u32)> {
        let mut pend = self.pendings.lock().unwrap();
        while pend.is_empty() && !self.closed.load(Ordering::Acquire) {
            pend = self.accept_cv.wait(pend).unwrap();
        }
        pend.pop_front()
    }

    /// Completes the server side of the handshake for a freshly-created
    /// child worker: seeds sequence state, emits SYN+ACK, and waits for
    /// ESTABLISHED.
    pub fn accept_complete(self: &Arc<Self>, local: SocketAddrV4, remote: SocketAddrV4, peer_isn: u32) -> bool {
        self.set_addrs(local, Some(remote));
        self.seq.set_rcv_isn(peer_isn.wrapping_add(1));
        self.state.set_eager(TcpState::SynReceived);
        self.enqueue_blocking(local, remote, TcpFlags::SYN | TcpFlags::ACK, Vec::new());
        self.state.wait_until(TcpState::Established, &self.closed)
    }

    /// Client side of the handshake. The handler drives `SYN_SENT` to either
    /// `ESTABLISHED` directly or, on simultaneous open, through
    /// `SYN_RECEIVED` first; either way this only needs to wait for the
    /// final state.
    pub fn connect(self: &Arc<Self>, local: SocketAddrV4, remote: SocketAddrV4) -> bool {
        self.set_addrs(local, Some(remote));
        self.state.set_eager(TcpState::SynSent);
        self.enqueue_blocking(local, remote, TcpFlags::SYN, Vec::new());
        self.state.wait_until(TcpState::Established, &self.closed)
    }

    pub fn read(&self, max_len: usize) -> SockResult<Vec<u8>> {
        let mut buf = self.recv_buf.lock().unwrap();
        loop {
            if buf.can_get(max_len) {
                return Ok(buf.get(max_len));
            }
            if self.closed.load(Ordering::Acquire) {
                if !buf.is_empty() {
                    let rest = buf.total_len();
                    return Ok(buf.get(rest));
                }
                return Err(Errno::ENotConn);
            }
            if self.peer_fin.load(Ordering::Acquire) && buf.is_empty() {
                return Ok(Vec::new());
            }
            buf = self.recv_cv.wait(buf).unwrap();
        }
    }

    pub fn write(self: &Arc<Self>, data: &[u8]) -> SockResult<usize> {
        let Some((local, remote)) = self.addrs_or_drop() else { return Err(Errno::ENotConn) };
        if !matches!(self.state(), TcpState::Established | TcpState::CloseWait) {
            return Err(Errno::ENotConn);
        }
        let seq = self.enqueue_blocking(local, remote, TcpFlags::PSH, data.to_vec());
        let mut list = self.send_list.lock().unwrap();
        loop {
            if self.abandoned.lock().unwrap().remove(&seq) {
                return Err(Errno::EConnReset);
            }
            if self.seq.snd_lt(seq, self.seq.snd_una()) {
                return Ok(data.len());
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Errno::EConnReset);
            }
            list = self.seq_cv.wait(list).unwrap();
        }
    }

    pub fn close(self: &Arc<Self>) {
        let Some((local, remote)) = self.addrs_or_drop() else {
            self.abandon_all_and_wake();
            return;
        };
        match self.state() {
            TcpState::Established | TcpState::Listen => {
                self.enqueue_blocking(local, remote, TcpFlags::FIN, Vec::new());
                self.state.set_eager(TcpState::FinWait1);
                self.state.wait_until(TcpState::TimedWait, &self.closed);
            }
            TcpState::CloseWait => {
                self.enqueue_blocking(local, remote, TcpFlags::FIN, Vec::new());
                self.state.set_eager(TcpState::LastAck);
                self.state.wait_until(TcpState::Closed, &self.closed);
            }
            _ => {}
        }
        std::thread::sleep(2 * self.config.msl);
        self.state.commit(TcpState::Closed);
        self.abandon_all_and_wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::ArpManager;
    use crate::device::DeviceManager;
    use crate::route::RoutingTable;

    fn worker() -> Arc<TcpWorker> {
        let devices = DeviceManager::new();
        let arp = Arc::new(ArpManager::new());
        let routes = Arc::new(RoutingTable::new());
        let ip = IpEngine::new(devices, arp, routes);
        TcpWorker::new(ip, Arc::new(StackConfig::default()), 1000, 4)
    }

    #[test]
    fn fresh_worker_starts_closed() {
        assert_eq!(worker().state(), TcpState::Closed);
    }

    #[test]
    fn rst_transitions_established_to_closed() {
        let w = worker();
        w.set_addrs("10.0.0.1:4096".parse().unwrap(), Some("10.0.0.2:5000".parse().unwrap()));
        w.state.set_eager(TcpState::Established);
        let rst = TcpSegment::new(5000, 4096, 0, 0, TcpFlags::RST);
        w.handle_segment(&rst, "10.0.0.1:4096".parse().unwrap(), "10.0.0.2:5000".parse().unwrap());
        assert_eq!(w.state(), TcpState::Closed);
    }

    #[test]
    fn listen_socket_queues_syn_as_pending() {
        let w = worker();
        w.set_addrs("10.0.0.1:4096".parse().unwrap(), None);
        w.state.set_eager(TcpState::Listen);
        let syn = TcpSegment::new(5000, 4096, 777, 0, TcpFlags::SYN);
        w.handle_segment(&syn, "10.0.0.1:4096".parse().unwrap(), "10.0.0.2:5000".parse().unwrap());
        assert_eq!(w.state(), TcpState::Listen);
        let pend = w.pendings.lock().unwrap();
        assert_eq!(pend.len(), 1);
        assert_eq!(pend[0].1, 777);
    }

    #[test]
    fn established_data_segment_is_buffered_and_acked() {
        let w = worker();
        let local: SocketAddrV4 = "10.0.0.1:4096".parse().unwrap();
        let remote: SocketAddrV4 = "10.0.0.2:5000".parse().unwrap();
        w.set_addrs(local, Some(remote));
        w.seq.set_rcv_isn(999);
        w.state.set_eager(TcpState::Established);
        let data = TcpSegment::new(5000, 4096, 999, 0, TcpFlags::PSH).with_data(b"hi".to_vec());
        w.handle_segment(&data, local, remote);
        assert_eq!(w.state(), TcpState::Established);
        assert_eq!(w.seq.rcv_nxt(), 1001);
        let got = w.read(2).unwrap();
        assert_eq!(got, b"hi");
    }
}
