//! IPv4 send/receive and the glue between ARP, the routing table, and the
//! upper-layer (TCP) demux (§4.3).

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::arp::ArpManager;
use crate::config::StackConfig;
use crate::device::{DeviceId, DeviceManager};
use crate::error::{IpError, IpResult};
use crate::ether::{ones_complement_checksum, ETHERTYPE_IPV4};
use crate::route::RoutingTable;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV4_INITIAL_TTL: u8 = 16;
const IPV4_FLAG_DF: u16 = 0x4000;
pub const IPPROTO_TCP: u8 = 6;

/// A parsed (host-order) IPv4 header, options stripped.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub total_len: u16,
}

impl Ipv4Header {
    fn encode(&self, checksum: u16) -> [u8; IPV4_HEADER_LEN] {
        let mut buf = [0u8; IPV4_HEADER_LEN];
        buf[0] = 0x45; // version 4, IHL 5
        buf[1] = 0; // TOS
        buf[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&0u16.to_be_bytes()); // id
        buf[6..8].copy_from_slice(&IPV4_FLAG_DF.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.proto;
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
        buf
    }

    /// Builds and serializes a header with a freshly computed checksum.
    fn build(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, ttl: u8, payload_len: usize) -> [u8; IPV4_HEADER_LEN] {
        let header = Ipv4Header { ttl, proto, src, dst, total_len: (IPV4_HEADER_LEN + payload_len) as u16 };
        let checksum = ones_complement_checksum(&header.encode(0));
        header.encode(checksum)
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < IPV4_HEADER_LEN {
            return None;
        }
        if buf[0] >> 4 != 4 {
            return None;
        }
        Some(Self {
            ttl: buf[8],
            proto: buf[9],
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            total_len: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

pub fn verify_checksum(buf: &[u8]) -> bool {
    buf.len() >= IPV4_HEADER_LEN && ones_complement_checksum(&buf[..IPV4_HEADER_LEN]) == 0
}

/// Invoked with `(payload, src_ip, dst_ip, dev)` for every IPv4 datagram
/// addressed to an owned device. Registered once by the socket layer.
pub type IpCallback = Arc<dyn Fn(&[u8], Ipv4Addr, Ipv4Addr, DeviceId) -> i32 + Send + Sync>;

pub struct IpEngine {
    devices: Arc<DeviceManager>,
    arp: Arc<ArpManager>,
    routes: Arc<RoutingTable>,
    upper: Mutex<Option<IpCallback>>,
}

impl IpEngine {
    pub fn new(devices: Arc<DeviceManager>, arp: Arc<ArpManager>, routes: Arc<RoutingTable>) -> Arc<Self> {
        Arc::new(Self { devices, arp, routes, upper: Mutex::new(None) })
    }

    pub fn set_ip_callback(&self, cb: IpCallback) {
        *self.upper.lock().unwrap() = Some(cb);
    }

    /// `sendIP(src, dst, proto, payload)` (§4.3).
    pub fn send_ip(&self, src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8], config: &StackConfig) -> IpResult<()> {
        let dev = self.devices.get_by_ip(src).ok_or(IpError::NoDeviceForSource)?;

        let (next_hop, egress) = if dev.same_subnet(dst) {
            let mac = self.arp.get_mac_addr(&dev, dst, config.arp_max_retry, config);
            (mac, dev.id)
        } else {
            let route = self.routes.lookup(dst).ok_or(IpError::NoRoute)?;
            (route.next_hop, route.dev)
        };

        let header = Ipv4Header::build(src, dst, proto, IPV4_INITIAL_TTL, payload.len());
        let mut frame = Vec::with_capacity(IPV4_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);

        self.devices.send_frame(egress, ETHERTYPE_IPV4, next_hop, &frame).map_err(|_| IpError::NoDeviceForSource)
    }

    /// The IPv4 callback (§4.3 "IPv4 receive"), invoked by the dispatcher for
    /// every frame with EtherType `0x0800`.
    pub fn handle_frame(&self, dev_id: DeviceId, buf: &[u8]) -> i32 {
        if !verify_checksum(buf) {
            warn!("ipv4: checksum mismatch on device {dev_id}, continuing anyway");
        }
        let Some(header) = Ipv4Header::decode(buf) else {
            return -1;
        };
        let total_len = (header.total_len as usize).min(buf.len());
        let payload = &buf[IPV4_HEADER_LEN..total_len];

        if self.devices.have_device_with_ip(header.dst) {
            trace!("ipv4: delivering {} byte(s) from {} to {}", payload.len(), header.src, header.dst);
            let cb = self.upper.lock().unwrap().clone();
            return match cb {
                Some(cb) => cb(payload, header.src, header.dst, dev_id),
                None => -1,
            };
        }

        self.forward(header, payload)
    }

    fn forward(&self, header: Ipv4Header, payload: &[u8]) -> i32 {
        if header.ttl <= 1 {
            debug!("ipv4: TTL exhausted forwarding to {}, dropping", header.dst);
            return -1;
        }
        let Some(route) = self.routes.lookup(header.dst) else {
            debug!("ipv4: no route to {}, dropping", header.dst);
            return -1;
        };

        let new_header = Ipv4Header::build(header.src, header.dst, header.proto, header.ttl - 1, payload.len());
        let mut frame = Vec::with_capacity(IPV4_HEADER_LEN + payload.len());
        frame.extend_from_slice(&new_header);
        frame.extend_from_slice(payload);

        match self.devices.send_frame(route.dev, ETHERTYPE_IPV4, route.next_hop, &frame) {
            Ok(()) => 0,
            Err(e) => {
                warn!("ipv4: forward to {} failed: {e}", header.dst);
                -1
            }
        }
    }
}

/// Builds the boxed callback the device dispatcher registers for
/// `ETHERTYPE_IPV4`.
pub fn callback(ip: Arc<IpEngine>) -> crate::device::FrameCallback {
    std::sync::Arc::new(move |buf, dev_id| ip.handle_frame(dev_id, buf))
}
