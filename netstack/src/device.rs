//! Per-interface capture/send engine and the cross-device frame dispatcher.
//!
//! Each [`Device`] owns one capture thread (blocking read loop) and one send
//! thread (condvar-driven queue drain), mirroring §4.1's "Scheduling model".
//! The [`DeviceManager`] owns every device and the EtherType registry that
//! the dispatcher consults.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{debug, trace, warn};

use crate::capture::{CaptureBackend, CaptureHandle};
use crate::error::{DeviceError, DeviceResult};
use crate::ether::{build_frame, EthernetHeader, MacAddr, ETH_MAX_PAYLOAD_LEN};

pub type DeviceId = usize;

/// A registered per-EtherType handler, invoked with the frame's payload
/// (Ethernet header already stripped) and the id of the device it arrived
/// on. Returns 0 on success, non-zero on error (§7's callback-propagation
/// contract); the dispatcher only logs a non-zero return.
pub type FrameCallback = Arc<dyn Fn(&[u8], DeviceId) -> i32 + Send + Sync>;

/// EtherType → callback registry.
///
/// The realistic closed set is exactly {IPv4, ARP, SDP} plus room for one
/// administrator-registered EtherType (§9's "dynamic dispatch" note), so
/// this is a small fixed-capacity table rather than a general map.
const REGISTRY_SLOTS: usize = 4;

pub struct EtherTypeRegistry {
    slots: Mutex<[Option<(u16, FrameCallback)>; REGISTRY_SLOTS]>,
}

impl EtherTypeRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([None, None, None, None]),
        }
    }

    /// Upserts a callback for `ethertype`. Returns `1` if this registered a
    /// new EtherType, `0` if it replaced an existing one, `-1` if the
    /// registry is full.
    pub fn set(&self, ethertype: u16, cb: FrameCallback) -> i32 {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some((et, _)) = slot {
                if *et == ethertype {
                    *slot = Some((ethertype, cb));
                    return 0;
                }
            }
        }
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some((ethertype, cb));
                return 1;
            }
        }
        -1
    }

    pub fn get(&self, ethertype: u16) -> Option<FrameCallback> {
        let slots = self.slots.lock().unwrap();
        slots.iter().flatten().find(|(et, _)| *et == ethertype).map(|(_, cb)| cb.clone())
    }
}

impl Default for EtherTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct SendQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, frame: Vec<u8>) {
        self.items.lock().unwrap().push_back(frame);
        self.cv.notify_one();
    }

    /// Blocks until at least one frame is queued or the device is shutting
    /// down, then drains the whole queue (§4.1: "on wake, it drains every
    /// queued frame").
    fn drain_blocking(&self, shutdown: &AtomicBool) -> Vec<Vec<u8>> {
        let mut items = self.items.lock().unwrap();
        while items.is_empty() && !shutdown.load(Ordering::Acquire) {
            items = self.cv.wait(items).unwrap();
        }
        items.drain(..).collect()
    }
}

/// A local network interface owned by the stack.
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub sniff: bool,
    handle: Box<dyn CaptureHandle>,
    send_queue: SendQueue,
    shutdown: AtomicBool,
    threads: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Device {
    /// `sendFrame` (§4.1): builds a frame with this device's MAC as source,
    /// enqueues it for the send thread. Fails if the payload exceeds the MTU.
    pub fn send_frame(&self, ethertype: u16, dst: MacAddr, payload: &[u8]) -> DeviceResult<()> {
        if payload.len() > ETH_MAX_PAYLOAD_LEN {
            return Err(DeviceError::PayloadTooLarge { len: payload.len() });
        }
        let frame = build_frame(dst, self.mac, ethertype, payload);
        self.send_queue.push(frame);
        Ok(())
    }

    pub fn same_subnet(&self, other: Ipv4Addr) -> bool {
        u32::from(self.ipv4) & u32::from(self.netmask) == u32::from(other) & u32::from(self.netmask)
    }
}

/// Owns every [`Device`] and the EtherType registry the dispatcher consults.
pub struct DeviceManager {
    devices: RwLock<Vec<Arc<Device>>>,
    next_id: AtomicUsize,
    pub registry: EtherTypeRegistry,
}

impl DeviceManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            registry: EtherTypeRegistry::new(),
        })
    }

    /// `addDevice(name, sniff)`: opens the interface through `backend`,
    /// spawns its capture and send threads, and adds it to the device
    /// table. Fails (mirroring the source's `id = -1` convention as an
    /// `Err`) if the interface cannot be opened or its addresses cannot be
    /// resolved.
    pub fn add_device(
        self: &Arc<Self>,
        name: &str,
        sniff: bool,
        backend: &dyn CaptureBackend,
    ) -> DeviceResult<DeviceId> {
        let iface = backend
            .enumerate()
            .into_iter()
            .find(|i| i.name == name)
            .ok_or(DeviceError::NoAddressForInterface)?;
        let handle = backend.open(name)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let device = Arc::new(Device {
            id,
            name: name.to_string(),
            mac: iface.mac,
            ipv4: iface.ipv4,
            netmask: iface.netmask,
            sniff,
            handle,
            send_queue: SendQueue::new(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(None),
        });

        self.devices.write().unwrap().push(device.clone());

        let capture_thread = {
            let device = device.clone();
            let mgr = self.clone();
            std::thread::spawn(move || capture_loop(device, mgr))
        };
        let send_thread = {
            let device = device.clone();
            std::thread::spawn(move || send_loop(device))
        };
        *device.threads.lock().unwrap() = Some((capture_thread, send_thread));

        debug!("device {id} ({name}) up: mac={} ip={}", device.mac, device.ipv4);
        Ok(id)
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.read().unwrap().iter().find(|d| d.id == id).cloned()
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Arc<Device>> {
        self.devices.read().unwrap().iter().find(|d| d.ipv4 == ip).cloned()
    }

    pub fn have_device_with_ip(&self, ip: Ipv4Addr) -> bool {
        self.get_by_ip(ip).is_some()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().unwrap().clone()
    }

    /// `sendFrame(buf, len, ethtype, destmac, device)` looked up by id.
    pub fn send_frame(&self, id: DeviceId, ethertype: u16, dst: MacAddr, payload: &[u8]) -> DeviceResult<()> {
        self.get(id).ok_or(DeviceError::UnknownDevice)?.send_frame(ethertype, dst, payload)
    }

    /// Stops every device's capture/send threads. Closing the capture handle
    /// unblocks `recv_blocking`; the shutdown flag plus a spurious notify
    /// unblocks the send loop.
    pub fn shutdown(&self) {
        for device in self.devices.read().unwrap().iter() {
            device.shutdown.store(true, Ordering::Release);
            device.handle.close();
            device.send_queue.cv.notify_all();
        }
    }
}

fn capture_loop(device: Arc<Device>, mgr: Arc<DeviceManager>) {
    loop {
        let Some(frame) = device.handle.recv_blocking() else {
            break;
        };
        if frame.len() < crate::ether::ETH_HEADER_LEN {
            trace!("device {}: dropping truncated frame ({} bytes)", device.id, frame.len());
            continue;
        }
        dispatch(&device, &mgr, &frame);
    }
}

fn send_loop(device: Arc<Device>) {
    loop {
        let frames = device.send_queue.drain_blocking(&device.shutdown);
        if frames.is_empty() && device.shutdown.load(Ordering::Acquire) {
            break;
        }
        for frame in frames {
            if let Err(e) = device.handle.inject(&frame) {
                warn!("device {}: injection failed: {e}", device.id);
            }
        }
    }
}

/// The global frame callback (§4.1 "Global frame callback (dispatcher)").
fn dispatch(device: &Device, mgr: &DeviceManager, frame: &[u8]) {
    let Some(eth) = EthernetHeader::parse(frame) else {
        return;
    };
    if eth.src == device.mac {
        // Our own traffic looped back by the capture facility.
        return;
    }
    if eth.dst != device.mac && !eth.dst.is_broadcast() {
        return;
    }
    let Some(cb) = mgr.registry.get(eth.ethertype) else {
        trace!("device {}: no callback for ethertype {:#06x}", device.id, eth.ethertype);
        return;
    };
    let payload = &frame[crate::ether::ETH_HEADER_LEN..];
    let rc = cb(payload, device.id);
    if rc != 0 {
        warn!("device {}: callback for ethertype {:#06x} returned {rc}", device.id, eth.ethertype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_upsert_return_codes() {
        let reg = EtherTypeRegistry::new();
        let noop: FrameCallback = Arc::new(|_, _| 0);
        assert_eq!(reg.set(0x0800, noop.clone()), 1);
        assert_eq!(reg.set(0x0800, noop.clone()), 0);
        assert_eq!(reg.set(0x0806, noop.clone()), 1);
        assert_eq!(reg.set(0x2333, noop.clone()), 1);
        assert_eq!(reg.set(0x1234, noop.clone()), 1);
        assert_eq!(reg.set(0x5678, noop), -1);
    }

    #[test]
    fn registry_lookup_miss_returns_none() {
        let reg = EtherTypeRegistry::new();
        assert!(reg.get(0x0800).is_none());
    }
}
