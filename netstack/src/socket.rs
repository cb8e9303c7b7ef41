//! POSIX-shaped socket surface and inbound IP→TCP demultiplexing (§6, §4.5
//! "Socket demux").

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::config::StackConfig;
use crate::device::DeviceManager;
use crate::error::{Errno, SockResult};
use crate::ipv4::IpEngine;
use crate::route::RoutingTable;
use crate::tcp::seq::IsnGenerator;
use crate::tcp::segment::{TcpFlags, TcpSegment};
use crate::tcp::worker::{TcpState, TcpWorker};

/// `socket(domain, ...)`: only `AF_INET` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
}

/// `socket(..., type, ...)`: only `SOCK_STREAM` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
}

/// `socket(..., ..., protocol)`: only `IPPROTO_TCP` (or 0, meaning "default
/// for the type") is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Unspecified,
}

struct Socket {
    worker: Arc<TcpWorker>,
}

pub struct SocketManager {
    sockets: RwLock<HashMap<i32, Arc<Socket>>>,
    next_fd: AtomicI32,
    listeners: RwLock<HashMap<SocketAddrV4, Arc<Socket>>>,
    established: RwLock<HashMap<(SocketAddrV4, SocketAddrV4), Arc<Socket>>>,
    ephemeral_counters: Mutex<HashMap<Ipv4Addr, u16>>,

    ip: Arc<IpEngine>,
    devices: Arc<DeviceManager>,
    routes: Arc<RoutingTable>,
    config: Arc<StackConfig>,
    isn: Arc<IsnGenerator>,
}

impl SocketManager {
    pub fn new(ip: Arc<IpEngine>, devices: Arc<DeviceManager>, routes: Arc<RoutingTable>, config: Arc<StackConfig>) -> Arc<Self> {
        let mgr = Arc::new(Self {
            sockets: RwLock::new(HashMap::new()),
            next_fd: AtomicI32::new(1024),
            listeners: RwLock::new(HashMap::new()),
            established: RwLock::new(HashMap::new()),
            ephemeral_counters: Mutex::new(HashMap::new()),
            ip,
            devices,
            routes,
            config,
            isn: Arc::new(IsnGenerator::new()),
        });
        mgr.install_ip_callback();
        mgr
    }

    fn install_ip_callback(self: &Arc<Self>) {
        let mgr = self.clone();
        self.ip.set_ip_callback(Arc::new(move |payload, src_ip, dst_ip, _dev| mgr.demux(payload, src_ip, dst_ip)));
    }

    /// `socket(domain, type, protocol)` (§6).
    pub fn socket(self: &Arc<Self>, domain: AddressFamily, ty: SocketType, proto: Protocol) -> SockResult<i32> {
        if domain != AddressFamily::Inet {
            return Err(Errno::EafNoSupport);
        }
        if ty != SocketType::Stream {
            return Err(Errno::EProtoType);
        }
        if proto == Protocol::Tcp || proto == Protocol::Unspecified {
            // ok
        } else {
            return Err(Errno::EProtoNoSupport);
        }
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        let worker = TcpWorker::new(self.ip.clone(), self.config.clone(), self.isn.next(), self.config.listen_backlog_default);
        worker.spawn_sender_loops();
        self.sockets.write().unwrap().insert(fd, Arc::new(Socket { worker }));
        Ok(fd)
    }

    fn get(&self, fd: i32) -> SockResult<Arc<Socket>> {
        self.sockets.read().unwrap().get(&fd).cloned().ok_or(Errno::EBadF)
    }

    pub fn bind(&self, fd: i32, addr: SocketAddrV4) -> SockResult<()> {
        let sock = self.get(fd)?;
        if sock.worker.state() != TcpState::Closed {
            return Err(Errno::EInval);
        }
        if self.listeners.read().unwrap().contains_key(&addr) {
            return Err(Errno::EAddrInUse);
        }
        sock.worker.set_addrs(addr, None);
        Ok(())
    }

    pub fn listen(&self, fd: i32, backlog: usize) -> SockResult<()> {
        let sock = self.get(fd)?;
        let (local, _) = sock.worker.addrs();
        let local = local.ok_or(Errno::EInval)?;
        sock.worker.listen(if backlog == 0 { self.config.listen_backlog_default } else { backlog });
        self.listeners.write().unwrap().insert(local, sock);
        Ok(())
    }

    pub fn accept(&self, fd: i32) -> SockResult<i32> {
        let listener = self.get(fd)?;
        let (local, _) = listener.worker.addrs();
        let local = local.ok_or(Errno::EInval)?;
        let Some((remote, peer_isn)) = listener.worker.accept_pending() else {
            return Err(Errno::EConnReset);
        };

        let new_fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        let child_worker = TcpWorker::new(self.ip.clone(), self.config.clone(), self.isn.next(), self.config.listen_backlog_default);
        child_worker.spawn_sender_loops();
        let child = Arc::new(Socket { worker: child_worker.clone() });
        self.sockets.write().unwrap().insert(new_fd, child.clone());
        self.established.write().unwrap().insert((local, remote), child);

        if !child_worker.accept_complete(local, remote, peer_isn) {
            return Err(Errno::EConnReset);
        }
        debug!("tcp: accepted {remote} on {local} as fd {new_fd}");
        Ok(new_fd)
    }

    pub fn connect(&self, fd: i32, dst: SocketAddrV4) -> SockResult<()> {
        let sock = self.get(fd)?;
        let (existing_local, _) = sock.worker.addrs();
        let local = match existing_local {
            Some(l) => l,
            None => self.choose_local_addr(*dst.ip())?,
        };
        self.established.write().unwrap().insert((local, dst), sock.clone());
        if sock.worker.connect(local, dst) {
            Ok(())
        } else {
            Err(Errno::ETimedOut)
        }
    }

    fn choose_local_addr(&self, dst: Ipv4Addr) -> SockResult<SocketAddrV4> {
        let device = if let Some(dev) = self.devices.get_by_ip(dst) {
            dev
        } else if let Some(dev) = self.devices.devices().into_iter().find(|d| d.same_subnet(dst)) {
            dev
        } else {
            let route = self.routes.lookup(dst).ok_or(Errno::EInval)?;
            self.devices.get(route.dev).ok_or(Errno::EInval)?
        };
        let port = {
            let mut counters = self.ephemeral_counters.lock().unwrap();
            let entry = counters.entry(dst).or_insert(self.config.ephemeral_port_base);
            let port = *entry;
            *entry = entry.wrapping_add(1);
            port
        };
        Ok(SocketAddrV4::new(device.ipv4, port))
    }

    pub fn read(&self, fd: i32, max_len: usize) -> SockResult<Vec<u8>> {
        self.get(fd)?.worker.read(max_len)
    }

    pub fn write(&self, fd: i32, data: &[u8]) -> SockResult<usize> {
        self.get(fd)?.worker.write(data)
    }

    pub fn close(&self, fd: i32) -> SockResult<()> {
        let sock = self.sockets.write().unwrap().remove(&fd).ok_or(Errno::EBadF)?;
        let (local, remote) = sock.worker.addrs();
        if let Some(local) = local {
            self.listeners.write().unwrap().remove(&local);
            if let Some(remote) = remote {
                self.established.write().unwrap().remove(&(local, remote));
            }
        }
        sock.worker.close();
        Ok(())
    }

    /// The inbound IP callback registered with [`IpEngine`]: demuxes a TCP
    /// segment to a socket, or replies with RST when none matches (§4.5,
    /// §9).
    fn demux(self: &Arc<Self>, payload: &[u8], src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> i32 {
        let Some(seg) = TcpSegment::decode(payload) else {
            return -1;
        };
        let remote = SocketAddrV4::new(src_ip, seg.src_port);
        let local = SocketAddrV4::new(dst_ip, seg.dst_port);

        let target = if seg.flags.is_syn() {
            self.listeners.read().unwrap().get(&local).cloned()
        } else {
            self.established.read().unwrap().get(&(local, remote)).cloned()
        };

        match target {
            Some(sock) => {
                sock.worker.handle_segment(&seg, local, remote);
                0
            }
            None => {
                if !seg.flags.with_rst() {
                    self.send_rst_reply(&seg, local, remote);
                }
                -1
            }
        }
    }

    fn send_rst_reply(&self, seg: &TcpSegment, local: SocketAddrV4, remote: SocketAddrV4) {
        let seq = if seg.flags.with_ack() { seg.ack } else { 0 };
        let ack = seg.seq.wrapping_add(seg.data.len() as u32);
        let rst = TcpSegment::new(local.port(), remote.port(), seq, ack, TcpFlags::RST | TcpFlags::ACK);
        let wire = rst.encode(*local.ip(), *remote.ip());
        if let Err(e) = self.ip.send_ip(*local.ip(), *remote.ip(), crate::ipv4::IPPROTO_TCP, &wire, &self.config) {
            warn!("tcp: failed to send RST to {remote}: {e}");
        }
    }
}

/// `getaddrinfo(node, service, hints)` restricted to IPv4/TCP (§6).
pub fn getaddrinfo(node: &str, service: &str, family: AddressFamily, socktype: SocketType) -> SockResult<SocketAddrV4> {
    if family != AddressFamily::Inet {
        return Err(Errno::EAiFamily);
    }
    if socktype != SocketType::Stream {
        return Err(Errno::EAiSockType);
    }
    let ip: Ipv4Addr = node.parse().map_err(|_| Errno::EAiNoName)?;
    let port: u16 = service.parse().map_err(|_| Errno::EAiBadFlags)?;
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::ArpManager;

    fn manager() -> Arc<SocketManager> {
        let devices = DeviceManager::new();
        let arp = Arc::new(ArpManager::new());
        let routes = Arc::new(RoutingTable::new());
        let ip = IpEngine::new(devices.clone(), arp, routes.clone());
        SocketManager::new(ip, devices, routes, Arc::new(StackConfig::default()))
    }

    #[test]
    fn socket_rejects_unsupported_domain() {
        let mgr = manager();
        // Only AF_INET/SOCK_STREAM is exercised directly; any other domain
        // value would have to come through a wrapper FFI layer out of scope
        // here, so this asserts the one supported combination succeeds.
        assert!(mgr.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).is_ok());
    }

    #[test]
    fn fds_start_at_1024_and_increase() {
        let mgr = manager();
        let a = mgr.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        let b = mgr.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp).unwrap();
        assert_eq!(a, 1024);
        assert_eq!(b, 1025);
    }

    #[test]
    fn getaddrinfo_parses_ipv4_and_port() {
        let addr = getaddrinfo("10.0.0.2", "4096", AddressFamily::Inet, SocketType::Stream).unwrap();
        assert_eq!(addr, "10.0.0.2:4096".parse().unwrap());
    }

    #[test]
    fn getaddrinfo_rejects_non_numeric_host() {
        assert_eq!(getaddrinfo("not-an-ip", "4096", AddressFamily::Inet, SocketType::Stream), Err(Errno::EAiNoName));
    }

    #[test]
    fn demux_with_no_listener_sends_rst() {
        let mgr = manager();
        let seg = TcpSegment::new(5000, 4096, 42, 0, TcpFlags::SYN | TcpFlags::ACK);
        let wire = seg.encode(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1));
        // No device is registered, so send_ip will fail past the demux; this
        // just exercises that demux reports the unmatched segment rather than
        // panicking.
        let rc = mgr.demux(&wire[0..], Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(rc, -1);
    }
}
