//! A userspace Ethernet/ARP/IPv4/TCP stack with a private distance-vector
//! routing protocol (SDP), built on a pluggable packet-capture backend.
//!
//! [`stack::Stack`] is the entry point: construct one with a [`config::StackConfig`],
//! add devices through a [`capture::CaptureBackend`], call [`stack::Stack::bring_up`],
//! then drive sockets through [`stack::Stack::sockets`].

pub mod arp;
pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod ether;
pub mod ipv4;
pub mod route;
pub mod sdp;
pub mod socket;
pub mod stack;
pub mod tcp;

pub use stack::Stack;
