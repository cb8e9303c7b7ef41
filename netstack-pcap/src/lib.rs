//! [`CaptureBackend`] implementation over `pnet`/`pnet_datalink`: the real
//! NIC binding for the CLI binary (§10.5).

use std::net::Ipv4Addr;
use std::sync::Mutex;

use log::warn;
use netstack::capture::{CaptureBackend, CaptureHandle, InterfaceInfo};
use netstack::error::DeviceError;
use netstack::ether::MacAddr;
use pnet_datalink::{self as datalink, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};

pub struct PnetBackend;

impl PnetBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PnetBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn interface_ipv4(iface: &NetworkInterface) -> Option<(Ipv4Addr, Ipv4Addr)> {
    iface.ips.iter().find_map(|net| match net {
        ipnetwork::IpNetwork::V4(v4) => Some((v4.ip(), v4.mask())),
        _ => None,
    })
}

impl CaptureBackend for PnetBackend {
    fn enumerate(&self) -> Vec<InterfaceInfo> {
        datalink::interfaces()
            .into_iter()
            .filter_map(|iface| {
                let mac = iface.mac?;
                let (ipv4, netmask) = interface_ipv4(&iface)?;
                Some(InterfaceInfo {
                    name: iface.name.clone(),
                    mac: MacAddr([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]),
                    ipv4,
                    netmask,
                })
            })
            .collect()
    }

    fn open(&self, ifname: &str) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == ifname)
            .ok_or(DeviceError::NoAddressForInterface)?;

        let (tx, rx) = match datalink::channel(&iface, Default::default()) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(DeviceError::CaptureOpenFailed),
            Err(_) => return Err(DeviceError::CaptureOpenFailed),
        };

        Ok(Box::new(PnetHandle { tx: Mutex::new(tx), rx: Mutex::new(rx) }))
    }
}

struct PnetHandle {
    tx: Mutex<Box<dyn DataLinkSender>>,
    rx: Mutex<Box<dyn DataLinkReceiver>>,
}

// `pnet_datalink`'s sender/receiver types are not `Send` by declaration in
// every backend, but this stack only ever touches a given handle from the
// two threads `Device` spawns for it (one reader, one writer), never
// concurrently from more; each half owns its own mutex.
unsafe impl Send for PnetHandle {}

impl CaptureHandle for PnetHandle {
    fn recv_blocking(&self) -> Option<Vec<u8>> {
        match self.rx.lock().unwrap().next() {
            Ok(frame) => Some(frame.to_vec()),
            Err(e) => {
                warn!("pcap: receive failed: {e}");
                None
            }
        }
    }

    fn inject(&self, frame: &[u8]) -> Result<(), DeviceError> {
        match self.tx.lock().unwrap().send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            _ => Err(DeviceError::CaptureOpenFailed),
        }
    }

    fn close(&self) {
        // `pnet_datalink` has no explicit unblocking primitive; the capture
        // thread exits on the next `recv_blocking` error once the process is
        // tearing down the interface.
    }
}
