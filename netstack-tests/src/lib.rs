//! In-memory [`CaptureBackend`] plus the end-to-end scenarios that can't
//! depend on a real NIC: ARP resolution, direct-subnet delivery, SDP
//! convergence, and the full TCP handshake/data/retransmit/teardown
//! lifecycle.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use netstack::capture::{CaptureBackend, CaptureHandle, InterfaceInfo};
use netstack::error::DeviceError;
use netstack::ether::MacAddr;

/// A shared broadcast segment: every frame injected by one registered MAC is
/// delivered to every other registered MAC on the same medium, modelling one
/// Ethernet collision domain.
pub struct MemoryMedium {
    senders: Mutex<Vec<(MacAddr, Sender<Vec<u8>>)>>,
    drop_next: Mutex<VecDeque<(MacAddr, usize)>>,
    drop_nth: Mutex<Vec<(MacAddr, usize, usize)>>,
}

impl MemoryMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
            drop_next: Mutex::new(VecDeque::new()),
            drop_nth: Mutex::new(Vec::new()),
        })
    }

    fn register(&self, mac: MacAddr) -> Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().unwrap().push((mac, tx));
        rx
    }

    fn unregister(&self, mac: MacAddr) {
        self.senders.lock().unwrap().retain(|(m, _)| *m != mac);
    }

    /// Registers a promiscuous listener that never injects anything, so a
    /// test can inspect exact wire frames instead of only stack-level
    /// behavior.
    pub fn sniff(&self) -> Receiver<Vec<u8>> {
        self.register(next_mac())
    }

    /// Silently drops the next `count` frames injected by `from`, to
    /// simulate loss for retransmission testing.
    pub fn drop_next_from(&self, from: MacAddr, count: usize) {
        self.drop_next.lock().unwrap().push_back((from, count));
    }

    /// Silently drops only the `n`th (1-indexed) frame injected by `from`,
    /// letting every other frame from it through.
    pub fn drop_nth_from(&self, from: MacAddr, n: usize) {
        self.drop_nth.lock().unwrap().push((from, n, 0));
    }

    fn should_drop(&self, from: MacAddr) -> bool {
        let mut pending = self.drop_next.lock().unwrap();
        if let Some(front) = pending.front_mut() {
            if front.0 == from {
                front.1 -= 1;
                let exhausted = front.1 == 0;
                if exhausted {
                    pending.pop_front();
                }
                return true;
            }
        }
        drop(pending);

        let mut nth = self.drop_nth.lock().unwrap();
        for entry in nth.iter_mut() {
            if entry.0 == from {
                entry.2 += 1;
                if entry.2 == entry.1 {
                    return true;
                }
            }
        }
        false
    }

    fn broadcast(&self, from: MacAddr, frame: Vec<u8>) {
        if self.should_drop(from) {
            return;
        }
        for (mac, tx) in self.senders.lock().unwrap().iter() {
            if *mac != from {
                let _ = tx.send(frame.clone());
            }
        }
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        unreachable!("MemoryMedium is always constructed behind an Arc via MemoryMedium::new")
    }
}

#[derive(Clone)]
pub struct InMemoryInterface {
    pub name: String,
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub medium: Arc<MemoryMedium>,
}

/// A [`CaptureBackend`] backed by [`MemoryMedium`]s instead of real NICs, so
/// whole multi-router topologies can run as plain threads inside one test
/// process.
pub struct InMemoryBackend {
    interfaces: Vec<InMemoryInterface>,
}

impl InMemoryBackend {
    pub fn new(interfaces: Vec<InMemoryInterface>) -> Self {
        Self { interfaces }
    }
}

impl CaptureBackend for InMemoryBackend {
    fn enumerate(&self) -> Vec<InterfaceInfo> {
        self.interfaces
            .iter()
            .map(|i| InterfaceInfo { name: i.name.clone(), mac: i.mac, ipv4: i.ipv4, netmask: i.netmask })
            .collect()
    }

    fn open(&self, ifname: &str) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let iface = self.interfaces.iter().find(|i| i.name == ifname).ok_or(DeviceError::NoAddressForInterface)?;
        let rx = iface.medium.register(iface.mac);
        Ok(Box::new(InMemoryHandle {
            mac: iface.mac,
            medium: iface.medium.clone(),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryHandle {
    mac: MacAddr,
    medium: Arc<MemoryMedium>,
    rx: Mutex<Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl CaptureHandle for InMemoryHandle {
    fn recv_blocking(&self) -> Option<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.rx.lock().unwrap().recv().ok()
    }

    fn inject(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.medium.broadcast(self.mac, frame.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.medium.unregister(self.mac);
    }
}

static NEXT_MAC: AtomicUsize = AtomicUsize::new(1);

/// Allocates a fresh locally-administered MAC for a test host, so scenario
/// setup doesn't have to hand-pick non-colliding addresses.
pub fn next_mac() -> MacAddr {
    let n = NEXT_MAC.fetch_add(1, Ordering::SeqCst) as u8;
    MacAddr([0xaa, 0, 0, 0, 0, n])
}

#[cfg(test)]
mod scenarios {
    use super::*;
    use std::net::SocketAddrV4;
    use std::time::Duration;

    use netstack::config::StackConfig;
    use netstack::error::Errno;
    use netstack::ether::{EthernetHeader, ETHERTYPE_IPV4, ETH_HEADER_LEN};
    use netstack::ipv4::IPV4_HEADER_LEN;
    use netstack::route::{mask_for_prefix_len, Metric, RouteEntry};
    use netstack::socket::{AddressFamily, Protocol, SocketType};
    use netstack::tcp::segment::TcpSegment;
    use netstack::Stack;

    fn iface(name: &str, ip: &str, medium: &Arc<MemoryMedium>) -> InMemoryInterface {
        InMemoryInterface {
            name: name.to_string(),
            mac: next_mac(),
            ipv4: ip.parse().unwrap(),
            netmask: mask_for_prefix_len(24),
            medium: medium.clone(),
        }
    }

    fn fast_config() -> StackConfig {
        StackConfig {
            arp_timeout: Duration::from_millis(200),
            tcp_timeout: Duration::from_millis(150),
            route_loop_interval: Duration::from_millis(80),
            route_loop_jitter: Duration::from_millis(0),
            msl: Duration::from_millis(100),
            ..StackConfig::default()
        }
    }

    fn bring_up_pair(lan: &Arc<MemoryMedium>) -> (Arc<Stack>, Arc<Stack>, InMemoryInterface, InMemoryInterface) {
        let a_if = iface("a0", "10.0.0.1", lan);
        let b_if = iface("b0", "10.0.0.2", lan);

        let a = Stack::new(fast_config());
        let backend_a = InMemoryBackend::new(vec![a_if.clone()]);
        a.add_device("a0", false, &backend_a).unwrap();
        a.bring_up();

        let b = Stack::new(fast_config());
        let backend_b = InMemoryBackend::new(vec![b_if.clone()]);
        b.add_device("b0", false, &backend_b).unwrap();
        b.bring_up();

        (a, b, a_if, b_if)
    }

    #[test]
    fn arp_resolve_across_shared_lan() {
        let lan = MemoryMedium::new();
        let (a, b, _a_if, b_if) = bring_up_pair(&lan);

        let dev = a.devices.get(0).unwrap();
        let mac = a.arp.get_mac_addr(&dev, Ipv4Addr::new(10, 0, 0, 2), 3, &a.config);
        assert_eq!(mac, b_if.mac);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn direct_subnet_ip_datagram_is_delivered() {
        let lan = MemoryMedium::new();
        let (a, b, _a_if, _b_if) = bring_up_pair(&lan);

        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        b.ip.set_ip_callback(Arc::new(move |payload, src, dst, _dev| {
            *received2.lock().unwrap() = Some((payload.to_vec(), src, dst));
            0
        }));

        a.ip.send_ip(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 17, b"hello, world!", &a.config).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let got = received.lock().unwrap().clone().expect("datagram not delivered");
        assert_eq!(got.0, b"hello, world!");
        assert_eq!(got.1, Ipv4Addr::new(10, 0, 0, 1));

        a.shutdown();
        b.shutdown();
    }

    fn connected_pair() -> (Arc<Stack>, Arc<Stack>, i32, i32) {
        let lan = MemoryMedium::new();
        let (client, server, _c_if, _s_if) = bring_up_pair(&lan);

        let server_fd = server.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let listen_addr: SocketAddrV4 = "10.0.0.2:4096".parse().unwrap();
        server.sockets.bind(server_fd, listen_addr).unwrap();
        server.sockets.listen(server_fd, 4).unwrap();

        let client_fd = client.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let server_for_accept = server.clone();
        let accept_thread = std::thread::spawn(move || server_for_accept.sockets.accept(server_fd).unwrap());

        client.sockets.connect(client_fd, listen_addr).unwrap();
        let accepted_fd = accept_thread.join().unwrap();

        (client, server, client_fd, accepted_fd)
    }

    #[test]
    fn tcp_three_way_handshake_reaches_established() {
        let (client, server, _client_fd, _accepted_fd) = connected_pair();
        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn tcp_data_respects_push_boundary() {
        let (client, server, client_fd, accepted_fd) = connected_pair();

        client.sockets.write(client_fd, b"Hello.").unwrap();
        let data = server.sockets.read(accepted_fd, 100).unwrap();
        assert_eq!(data, b"Hello.");

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn tcp_retransmits_after_drop_then_succeeds() {
        let lan = MemoryMedium::new();
        let (client, server, c_if, _s_if) = bring_up_pair(&lan);

        let server_fd = server.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let listen_addr: SocketAddrV4 = "10.0.0.2:4096".parse().unwrap();
        server.sockets.bind(server_fd, listen_addr).unwrap();
        server.sockets.listen(server_fd, 4).unwrap();

        let client_fd = client.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let server_for_accept = server.clone();
        let accept_thread = std::thread::spawn(move || server_for_accept.sockets.accept(server_fd).unwrap());
        client.sockets.connect(client_fd, listen_addr).unwrap();
        let accepted_fd = accept_thread.join().unwrap();

        // Drop the client's next outbound frame (the first data segment) once.
        lan.drop_next_from(c_if.mac, 1);
        let n = client.sockets.write(client_fd, b"retry me").unwrap();
        assert_eq!(n, 8);
        let data = server.sockets.read(accepted_fd, 100).unwrap();
        assert_eq!(data, b"retry me");

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn tcp_write_fails_after_exhausting_retransmits() {
        let lan = MemoryMedium::new();
        let (client, server, c_if, _s_if) = bring_up_pair(&lan);

        let server_fd = server.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let listen_addr: SocketAddrV4 = "10.0.0.2:4096".parse().unwrap();
        server.sockets.bind(server_fd, listen_addr).unwrap();
        server.sockets.listen(server_fd, 4).unwrap();

        let client_fd = client.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let server_for_accept = server.clone();
        let accept_thread = std::thread::spawn(move || server_for_accept.sockets.accept(server_fd).unwrap());
        client.sockets.connect(client_fd, listen_addr).unwrap();
        accept_thread.join().unwrap();

        // Drop every retransmission of the client's next segment.
        lan.drop_next_from(c_if.mac, 1 + client.config.tcp_max_retrans as usize);
        let err = client.sockets.write(client_fd, b"gone").unwrap_err();
        assert_eq!(err, Errno::EConnReset);

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn tcp_active_close_reaches_closed_within_two_msl() {
        let (client, server, client_fd, accepted_fd) = connected_pair();

        client.sockets.close(client_fd).unwrap();
        // Server observes the peer FIN as EOF before issuing its own close.
        let eof = server.sockets.read(accepted_fd, 100).unwrap();
        assert!(eof.is_empty());
        server.sockets.close(accepted_fd).unwrap();

        std::thread::sleep(client.config.msl * 2 + Duration::from_millis(50));
        client.shutdown();
        server.shutdown();
    }

    /// Decodes the TCP segment carried by a sniffed Ethernet/IPv4 frame, if
    /// any. Trusts the IPv4 total-length field to trim Ethernet's zero
    /// padding rather than `TcpSegment::decode`'s length-from-buffer
    /// inference, which would otherwise treat trailing pad bytes as payload.
    fn decode_tcp_segment(frame: &[u8]) -> Option<TcpSegment> {
        let eth = EthernetHeader::parse(frame)?;
        if eth.ethertype != ETHERTYPE_IPV4 {
            return None;
        }
        let ip_buf = &frame[ETH_HEADER_LEN..];
        if ip_buf.len() < IPV4_HEADER_LEN + 4 {
            return None;
        }
        let total_len = u16::from_be_bytes([ip_buf[2], ip_buf[3]]) as usize;
        let datagram = ip_buf.get(..total_len)?;
        TcpSegment::decode(&datagram[IPV4_HEADER_LEN..])
    }

    #[test]
    fn unmatched_segment_draws_rst() {
        let lan = MemoryMedium::new();
        let (a, b, _a_if, _b_if) = bring_up_pair(&lan);
        let sniffer = lan.sniff();

        // Nothing is listening on B; connecting should fail rather than hang.
        let client_fd = a.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let dst: SocketAddrV4 = "10.0.0.2:9000".parse().unwrap();
        let err = a.sockets.connect(client_fd, dst);
        assert!(err.is_err());

        let mut syn = None;
        let mut rst = None;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while rst.is_none() && std::time::Instant::now() < deadline {
            let Ok(frame) = sniffer.recv_timeout(Duration::from_millis(200)) else { continue };
            let Some(seg) = decode_tcp_segment(&frame) else { continue };
            if seg.flags.is_syn() && !seg.flags.with_ack() {
                syn.get_or_insert(seg);
            } else if seg.flags.with_rst() {
                rst = Some(seg);
            }
        }

        let syn = syn.expect("offending SYN was never observed on the wire");
        let rst = rst.expect("unmatched segment did not draw an RST");
        assert!(rst.flags.with_ack());
        assert_eq!(rst.seq, 0, "SYN carried no ACK, so the RST's seq must be 0");
        assert_eq!(rst.ack, syn.seq.wrapping_add(syn.data.len() as u32));

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn sdp_converges_across_a_three_router_line() {
        let lan_r1_r2 = MemoryMedium::new();
        let lan_r2_r3 = MemoryMedium::new();
        let stub1 = MemoryMedium::new();
        let stub3 = MemoryMedium::new();

        let r1_if1 = iface("r1-stub", "10.0.1.1", &stub1);
        let r1_if2 = iface("r1-up", "10.10.0.1", &lan_r1_r2);
        let r2_if1 = iface("r2-down", "10.10.0.2", &lan_r1_r2);
        let r2_if2 = iface("r2-up", "10.20.0.1", &lan_r2_r3);
        let r3_if1 = iface("r3-down", "10.20.0.2", &lan_r2_r3);
        let r3_if2 = iface("r3-stub", "10.0.3.1", &stub3);

        let r2 = Stack::new(fast_config());
        let backend2 = InMemoryBackend::new(vec![r2_if1.clone(), r2_if2.clone()]);
        r2.add_device("r2-down", false, &backend2).unwrap();
        r2.add_device("r2-up", false, &backend2).unwrap();
        r2.bring_up();

        let r3 = Stack::new(fast_config());
        let backend3 = InMemoryBackend::new(vec![r3_if1.clone(), r3_if2.clone()]);
        r3.add_device("r3-down", false, &backend3).unwrap();
        r3.add_device("r3-stub", false, &backend3).unwrap();
        r3.bring_up();

        // R1 comes up last, as the scenario requires.
        std::thread::sleep(Duration::from_millis(150));
        let r1 = Stack::new(fast_config());
        let backend1 = InMemoryBackend::new(vec![r1_if1.clone(), r1_if2.clone()]);
        r1.add_device("r1-stub", false, &backend1).unwrap();
        r1.add_device("r1-up", false, &backend1).unwrap();
        r1.bring_up();

        std::thread::sleep(fast_config().route_loop_interval * 3 + fast_config().arp_timeout);

        let route_to_r3_stub = r1.routes.lookup(Ipv4Addr::new(10, 0, 3, 5)).expect("route to r3's stub not learned");
        assert_eq!(route_to_r3_stub.dist, 3);
        assert_eq!(route_to_r3_stub.next_hop, r2_if1.mac);

        r1.shutdown();
        r2.shutdown();
        r3.shutdown();
    }

    /// A synthetic `/24` network distinct from any interface subnet used
    /// elsewhere in this file, so a batch of `count` of them can be preloaded
    /// into a table without colliding with each other or with real routes.
    fn synthetic_prefix(batch: u8, i: u32) -> Ipv4Addr {
        Ipv4Addr::new(10, batch, (i % 256) as u8, 0)
    }

    fn preload_synthetic_routes(stack: &Arc<Stack>, dev: netstack::device::DeviceId, batch: u8, count: u32) {
        for i in 0..count {
            stack.routes.set_item(RouteEntry {
                prefix: synthetic_prefix(batch, i),
                mask: mask_for_prefix_len(24),
                dev,
                next_hop: MacAddr::ZERO,
                dist: 1,
                is_local: false,
                metric: Metric::NoDel,
            });
        }
    }

    fn count_learned(stack: &Arc<Stack>, batch: u8, count: u32) -> usize {
        (0..count).filter(|&i| stack.routes.find(synthetic_prefix(batch, i), mask_for_prefix_len(24)).is_some()).count()
    }

    #[test]
    fn sdp_table_split_across_packets_is_fully_applied_once_both_arrive() {
        let lan = MemoryMedium::new();
        let r1_if = iface("r1", "10.0.0.1", &lan);
        let r2_if = iface("r2", "10.0.1.1", &lan);

        let r1 = Stack::new(fast_config());
        let backend1 = InMemoryBackend::new(vec![r1_if.clone()]);
        let r1_dev = r1.add_device("r1", false, &backend1).unwrap();
        // 300 entries forces the startup ISNEW advertisement (§4.3) across
        // two SDP packets: 255 items with UNFINISHED set, then the rest.
        preload_synthetic_routes(&r1, r1_dev, 90, 300);

        let r2 = Stack::new(fast_config());
        let backend2 = InMemoryBackend::new(vec![r2_if.clone()]);
        r2.add_device("r2", false, &backend2).unwrap();
        r2.bring_up();

        r1.bring_up();
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(count_learned(&r2, 90, 300), 300);

        r1.shutdown();
        r2.shutdown();
    }

    #[test]
    fn sdp_table_split_across_packets_applies_nothing_if_only_first_chunk_arrives() {
        let lan = MemoryMedium::new();
        let r1_if = iface("r1", "10.0.0.1", &lan);
        let r2_if = iface("r2", "10.0.1.1", &lan);

        let r1 = Stack::new(fast_config());
        let backend1 = InMemoryBackend::new(vec![r1_if.clone()]);
        let r1_dev = r1.add_device("r1", false, &backend1).unwrap();
        preload_synthetic_routes(&r1, r1_dev, 91, 300);

        let r2 = Stack::new(fast_config());
        let backend2 = InMemoryBackend::new(vec![r2_if.clone()]);
        r2.add_device("r2", false, &backend2).unwrap();
        r2.bring_up();

        // Drop the second (final) chunk of r1's startup broadcast, so only
        // the first UNFINISHED packet ever lands.
        lan.drop_nth_from(r1_if.mac, 2);
        r1.bring_up();
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(count_learned(&r2, 91, 300), 0);

        r1.shutdown();
        r2.shutdown();
    }

    #[test]
    fn static_routes_are_immune_to_aging() {
        let routes = netstack::route::RoutingTable::new();
        routes.set_item(RouteEntry {
            prefix: Ipv4Addr::new(0, 0, 0, 0),
            mask: mask_for_prefix_len(0),
            dev: 0,
            next_hop: MacAddr::BROADCAST,
            dist: 1,
            is_local: false,
            metric: Metric::NoDel,
        });
        for _ in 0..10 {
            routes.age(2);
        }
        assert!(routes.lookup(Ipv4Addr::new(8, 8, 8, 8)).is_some());
    }
}
