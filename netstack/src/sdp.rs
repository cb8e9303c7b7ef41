//! The Self-Destruct Protocol: a distance-vector routing protocol with
//! split-horizon, carried directly over Ethernet on a private EtherType
//! (§4.3, §6).

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};
use rand::Rng;

use crate::config::StackConfig;
use crate::device::{DeviceId, DeviceManager};
use crate::ether::{MacAddr, ETHERTYPE_SDP};
use crate::route::{Metric, RouteEntry, RoutingTable, SdpItem};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdpFlags: u8 {
        const INCREMENT = 0b0001;
        const UNFINISHED = 0b0010;
        const ISNEW = 0b0100;
        const VERIFY = 0b1000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u8 {
        const DEL = 0b0001;
    }
}

const HEADER_LEN: usize = 8;
const ITEM_LEN: usize = 8;
/// A 1-byte count field caps a single packet at 255 items (§4.3 "Packet size").
const MAX_ITEMS_PER_PACKET: usize = 255;

#[derive(Debug, Clone)]
pub struct SdpPacket {
    pub flags: SdpFlags,
    pub mac: MacAddr,
    pub items: Vec<SdpItem>,
}

impl SdpPacket {
    pub fn encode(&self) -> Vec<u8> {
        let count = self.items.len().min(MAX_ITEMS_PER_PACKET) as u8;
        let mut buf = Vec::with_capacity(HEADER_LEN + ITEM_LEN * count as usize);
        buf.push(count);
        buf.push(self.flags.bits());
        buf.extend_from_slice(self.mac.as_bytes());
        for item in self.items.iter().take(count as usize) {
            buf.extend_from_slice(&u32::from(item.prefix).to_be_bytes());
            buf.push(crate::route::prefix_len_for_mask(item.mask));
            let item_flags = if item.withdraw { ItemFlags::DEL } else { ItemFlags::empty() };
            buf.push(item_flags.bits());
            buf.extend_from_slice(&item.dist.to_be_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let count = buf[0] as usize;
        let flags = SdpFlags::from_bits_truncate(buf[1]);
        let mac = MacAddr(buf[2..8].try_into().unwrap());
        if buf.len() < HEADER_LEN + ITEM_LEN * count {
            return None;
        }
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let base = HEADER_LEN + i * ITEM_LEN;
            let prefix = Ipv4Addr::from(u32::from_be_bytes(buf[base..base + 4].try_into().unwrap()));
            let pflen = buf[base + 4] as u32;
            let item_flags = ItemFlags::from_bits_truncate(buf[base + 5]);
            let dist = u16::from_be_bytes([buf[base + 6], buf[base + 7]]);
            items.push(SdpItem {
                prefix,
                mask: crate::route::mask_for_prefix_len(pflen),
                dist,
                withdraw: item_flags.contains(ItemFlags::DEL),
            });
        }
        Some(Self { flags, mac, items })
    }
}

/// Key for reassembling a run of `UNFINISHED` packets: the same sender
/// advertising on the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ReassemblyKey {
    dev: DeviceId,
    mac: MacAddr,
}

pub struct SdpEngine {
    table: Arc<RoutingTable>,
    devices: Arc<DeviceManager>,
    reassembly: Mutex<std::collections::HashMap<ReassemblyKey, Vec<SdpItem>>>,
}

impl SdpEngine {
    pub fn new(table: Arc<RoutingTable>, devices: Arc<DeviceManager>) -> Arc<Self> {
        Arc::new(Self { table, devices, reassembly: Mutex::new(std::collections::HashMap::new()) })
    }

    /// Installs each owned directly-attached subnet as a local entry and
    /// broadcasts the initial `ISNEW` advertisement (§4.3 "Startup").
    pub fn init(&self) {
        for dev in self.devices.devices() {
            self.table.set_item(RouteEntry {
                prefix: Ipv4Addr::from(u32::from(dev.ipv4) & u32::from(dev.netmask)),
                mask: dev.netmask,
                dev: dev.id,
                next_hop: dev.mac,
                dist: 0,
                is_local: true,
                metric: Metric::NoDel,
            });
        }
        info!("sdp: startup table installed, broadcasting ISNEW");
        self.broadcast(self.table.live_entries_as_items(), SdpFlags::ISNEW, None);
    }

    /// The SDP callback (§4.3 "Receive"), invoked by the dispatcher for
    /// every frame with EtherType `0x2333`.
    pub fn handle_frame(&self, dev_id: DeviceId, buf: &[u8]) -> i32 {
        let Some(packet) = SdpPacket::decode(buf) else {
            warn!("sdp: malformed packet from device {dev_id}");
            return -1;
        };

        let key = ReassemblyKey { dev: dev_id, mac: packet.mac };
        let items = if packet.flags.contains(SdpFlags::UNFINISHED) {
            self.reassembly.lock().unwrap().entry(key).or_default().extend(packet.items.clone());
            debug!("sdp: buffered UNFINISHED chunk from {} on device {dev_id}", packet.mac);
            return 0;
        } else {
            let mut pending = self.reassembly.lock().unwrap().remove(&key).unwrap_or_default();
            pending.extend(packet.items);
            pending
        };

        let delta = self.apply_update(dev_id, packet.mac, &items);
        if !delta.is_empty() {
            info!("sdp: applied {} routing update(s) from device {dev_id}", delta.len());
            self.broadcast(delta, SdpFlags::INCREMENT, Some(dev_id));
        }

        if packet.flags.contains(SdpFlags::ISNEW) {
            if let Some(dev) = self.devices.get(dev_id) {
                self.send_to(&dev, self.table.live_entries_as_items(), SdpFlags::empty(), packet.mac);
            }
        }
        0
    }

    /// §4.3 "Receive" step 2: applies each advertised item to the table,
    /// returning the accepted subset for the split-horizon delta broadcast.
    fn apply_update(&self, dev_id: DeviceId, mac: MacAddr, items: &[SdpItem]) -> Vec<SdpItem> {
        let mut delta = Vec::new();
        for item in items {
            match self.table.find(item.prefix, item.mask) {
                Some(existing) => {
                    if mac == existing.next_hop {
                        if item.withdraw {
                            let mut e = existing.clone();
                            e.metric = Metric::Timeout;
                            self.table.set_item(e);
                        } else {
                            let mut e = existing.clone();
                            e.metric = Metric::Rounds(0);
                            self.table.set_item(e);
                            delta.push(*item);
                        }
                    } else if matches!(existing.metric, Metric::Timeout) {
                        // Ignore updates for an entry already withdrawn from its
                        // current next-hop.
                    } else if !item.withdraw && item.dist < existing.dist {
                        self.table.set_item(RouteEntry {
                            prefix: item.prefix,
                            mask: item.mask,
                            dev: dev_id,
                            next_hop: mac,
                            dist: item.dist,
                            is_local: false,
                            metric: Metric::Rounds(0),
                        });
                        delta.push(*item);
                    }
                }
                None => {
                    if item.withdraw {
                        warn!("sdp: withdraw for unknown route {}/{}", item.prefix, crate::route::prefix_len_for_mask(item.mask));
                    } else {
                        self.table.set_item(RouteEntry {
                            prefix: item.prefix,
                            mask: item.mask,
                            dev: dev_id,
                            next_hop: mac,
                            dist: item.dist,
                            is_local: false,
                            metric: Metric::Rounds(0),
                        });
                        delta.push(*item);
                    }
                }
            }
        }
        delta
    }

    /// Broadcasts `items` to every owned device except `exclude` (split
    /// horizon when relaying an update; `exclude = None` for the startup and
    /// periodic advertisements).
    fn broadcast(&self, items: Vec<SdpItem>, flags: SdpFlags, exclude: Option<DeviceId>) {
        for dev in self.devices.devices() {
            if Some(dev.id) == exclude {
                continue;
            }
            self.send_to(&dev, items.clone(), flags, MacAddr::BROADCAST);
        }
    }

    fn send_to(&self, dev: &crate::device::Device, items: Vec<SdpItem>, flags: SdpFlags, dst_mac: MacAddr) {
        let chunks: Vec<&[SdpItem]> = if items.is_empty() {
            vec![&[]]
        } else {
            items.chunks(MAX_ITEMS_PER_PACKET).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut chunk_flags = flags;
            if i != last {
                chunk_flags.insert(SdpFlags::UNFINISHED);
            }
            let packet = SdpPacket { flags: chunk_flags, mac: dev.mac, items: chunk.to_vec() };
            if let Err(e) = dev.send_frame(ETHERTYPE_SDP, dst_mac, &packet.encode()) {
                warn!("sdp: failed to send on device {}: {e}", dev.id);
            }
        }
    }

    /// `sendRoutingTable`-equivalent public entry point used by `Router`'s
    /// manual-route installation (§4.3 "addItem").
    pub fn advertise_item(&self, item: SdpItem) {
        self.broadcast(vec![item], SdpFlags::INCREMENT, None);
    }

    /// §4.3 "Periodic loop": runs until the process exits.
    pub fn run_periodic_loop(self: &Arc<Self>, config: &StackConfig) {
        loop {
            let jitter_ms = rand::thread_rng().gen_range(0..=config.route_loop_jitter.as_millis() as u64);
            std::thread::sleep(config.route_loop_interval + Duration::from_millis(jitter_ms));

            self.broadcast(self.table.live_entries_as_items(), SdpFlags::empty(), None);

            let (timed_out, _removed) = self.table.age(config.sdp_metric_timeout);
            if !timed_out.is_empty() {
                let withdrawals: Vec<SdpItem> = timed_out
                    .iter()
                    .map(|e| SdpItem { prefix: e.prefix, mask: e.mask, dist: e.dist, withdraw: true })
                    .collect();
                self.broadcast(withdrawals, SdpFlags::INCREMENT, None);
            }
        }
    }
}

impl RoutingTable {
    /// Live entries serialized as advertisement items, with the outgoing
    /// distance bumped by one hop (§4.3 "Distance semantics").
    pub fn live_entries_as_items(&self) -> Vec<SdpItem> {
        self.live_entries()
            .into_iter()
            .map(|e| SdpItem { prefix: e.prefix, mask: e.mask, dist: e.dist + 1, withdraw: false })
            .collect()
    }
}

/// Builds the boxed callback the device dispatcher registers for the SDP
/// EtherType.
pub fn callback(sdp: Arc<SdpEngine>) -> crate::device::FrameCallback {
    Arc::new(move |buf, dev_id| sdp.handle_frame(dev_id, buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(prefix: &str, len: u32, dist: u16, withdraw: bool) -> SdpItem {
        SdpItem {
            prefix: prefix.parse().unwrap(),
            mask: crate::route::mask_for_prefix_len(len),
            dist,
            withdraw,
        }
    }

    #[test]
    fn packet_round_trips() {
        let packet = SdpPacket {
            flags: SdpFlags::ISNEW,
            mac: MacAddr([1, 2, 3, 4, 5, 6]),
            items: vec![item("10.0.0.0", 24, 1, false), item("10.0.1.0", 24, 2, true)],
        };
        let decoded = SdpPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.flags, SdpFlags::ISNEW);
        assert_eq!(decoded.items.len(), 2);
        assert!(decoded.items[1].withdraw);
    }

    #[test]
    fn packet_size_matches_spec_formula() {
        let packet = SdpPacket { flags: SdpFlags::empty(), mac: MacAddr::ZERO, items: vec![item("10.0.0.0", 8, 0, false); 3] };
        assert_eq!(packet.encode().len(), 8 + 8 * 3);
    }

    #[test]
    fn split_across_more_than_255_items_sets_unfinished() {
        let table = RoutingTable::new();
        for i in 0..300u32 {
            table.set_item(RouteEntry {
                prefix: Ipv4Addr::from(10u32 << 24 | i << 8),
                mask: crate::route::mask_for_prefix_len(24),
                dev: 0,
                next_hop: MacAddr::ZERO,
                dist: 1,
                is_local: false,
                metric: Metric::Rounds(0),
            });
        }
        let items = table.live_entries_as_items();
        assert_eq!(items.len(), 300);
        let chunks: Vec<&[SdpItem]> = items.chunks(MAX_ITEMS_PER_PACKET).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 255);
        assert_eq!(chunks[1].len(), 45);
    }

    #[test]
    fn update_rejects_entry_with_worse_distance_from_new_neighbor() {
        let table = Arc::new(RoutingTable::new());
        table.set_item(RouteEntry {
            prefix: "10.0.0.0".parse().unwrap(),
            mask: crate::route::mask_for_prefix_len(24),
            dev: 0,
            next_hop: MacAddr([1; 6]),
            dist: 1,
            is_local: false,
            metric: Metric::Rounds(0),
        });
        let devices = DeviceManager::new();
        let engine = SdpEngine::new(table.clone(), devices);
        let delta = engine.apply_update(1, MacAddr([2; 6]), &[item("10.0.0.0", 24, 5, false)]);
        assert!(delta.is_empty());
        assert_eq!(table.find("10.0.0.0".parse().unwrap(), crate::route::mask_for_prefix_len(24)).unwrap().dist, 1);
    }
}
