//! Top-level `Stack`: wires every subsystem singleton together and owns
//! their lifetimes as fields of one value instead of process-global statics
//! (§9 "Global state").

use std::sync::Arc;

use log::info;

use crate::arp::ArpManager;
use crate::capture::CaptureBackend;
use crate::config::StackConfig;
use crate::device::DeviceManager;
use crate::error::DeviceResult;
use crate::ipv4::IpEngine;
use crate::route::RoutingTable;
use crate::sdp::SdpEngine;
use crate::socket::SocketManager;

pub struct Stack {
    pub config: Arc<StackConfig>,
    pub devices: Arc<DeviceManager>,
    pub arp: Arc<ArpManager>,
    pub routes: Arc<RoutingTable>,
    pub sdp: Arc<SdpEngine>,
    pub ip: Arc<IpEngine>,
    pub sockets: Arc<SocketManager>,
}

impl Stack {
    /// Constructs every subsystem and wires the EtherType registry, but
    /// starts no threads yet — call [`Stack::bring_up`] once devices have
    /// been added.
    pub fn new(config: StackConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let devices = DeviceManager::new();
        let arp = Arc::new(ArpManager::new());
        let routes = Arc::new(RoutingTable::new());
        let sdp = SdpEngine::new(routes.clone(), devices.clone());
        let ip = IpEngine::new(devices.clone(), arp.clone(), routes.clone());
        let sockets = SocketManager::new(ip.clone(), devices.clone(), routes.clone(), config.clone());

        devices.registry.set(crate::ether::ETHERTYPE_ARP, crate::arp::callback(arp.clone(), devices.clone()));
        devices.registry.set(crate::ether::ETHERTYPE_IPV4, crate::ipv4::callback(ip.clone()));
        devices.registry.set(crate::ether::ETHERTYPE_SDP, crate::sdp::callback(sdp.clone()));

        Arc::new(Self { config, devices, arp, routes, sdp, ip, sockets })
    }

    /// `addDevice(name, sniff)` at the stack level: opens the interface
    /// through `backend` and starts its capture/send threads.
    pub fn add_device(self: &Arc<Self>, name: &str, sniff: bool, backend: &dyn CaptureBackend) -> DeviceResult<crate::device::DeviceId> {
        self.devices.add_device(name, sniff, backend)
    }

    /// Installs each device's directly-attached subnet, broadcasts the
    /// initial SDP advertisement, and starts the periodic routing thread
    /// (§4.3 "Startup").
    pub fn bring_up(self: &Arc<Self>) {
        self.sdp.init();
        let sdp = self.sdp.clone();
        let config = self.config.clone();
        std::thread::spawn(move || sdp.run_periodic_loop(&config));
        info!("stack: brought up with {} device(s)", self.devices.devices().len());
    }

    pub fn shutdown(&self) {
        self.devices.shutdown();
    }
}
