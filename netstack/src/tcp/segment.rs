//! TCP header pack/unpack, pseudo-header checksum, and flag predicates
//! (§4.4, §3 "TCP segment").

use std::net::Ipv4Addr;

use bitflags::bitflags;

use crate::ether::ones_complement_checksum;

pub const TCP_HEADER_LEN: usize = 20;
pub const TCP_MAXWIN: u16 = u16::MAX;
const TCP_PROTO: u8 = 6;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
    }
}

impl TcpFlags {
    pub fn is_type_none(self) -> bool {
        self.is_empty()
    }
}

impl TcpFlags {
    pub fn is_fin(self) -> bool {
        self == TcpFlags::FIN
    }
    pub fn with_fin(self) -> bool {
        self.contains(TcpFlags::FIN)
    }
    pub fn is_syn(self) -> bool {
        self == TcpFlags::SYN
    }
    pub fn with_syn(self) -> bool {
        self.contains(TcpFlags::SYN)
    }
    pub fn is_rst(self) -> bool {
        self == TcpFlags::RST
    }
    pub fn with_rst(self) -> bool {
        self.contains(TcpFlags::RST)
    }
    pub fn is_psh(self) -> bool {
        self == TcpFlags::PSH
    }
    pub fn with_psh(self) -> bool {
        self.contains(TcpFlags::PSH)
    }
    pub fn is_ack(self) -> bool {
        self == TcpFlags::ACK
    }
    pub fn with_ack(self) -> bool {
        self.contains(TcpFlags::ACK)
    }
    pub fn is_urg(self) -> bool {
        self == TcpFlags::URG
    }
    pub fn with_urg(self) -> bool {
        self.contains(TcpFlags::URG)
    }
    pub fn is_syn_ack(self) -> bool {
        self == TcpFlags::SYN | TcpFlags::ACK
    }
    pub fn is_fin_ack(self) -> bool {
        self == TcpFlags::FIN | TcpFlags::ACK
    }
}

#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub data: Vec<u8>,
}

impl TcpSegment {
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self { src_port, dst_port, seq, ack, flags, window: TCP_MAXWIN, urgent: 0, data: Vec::new() }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    fn encode_header(&self, checksum: u16) -> [u8; TCP_HEADER_LEN] {
        let mut buf = [0u8; TCP_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = 5 << 4; // data offset: 5 words, no options
        buf[13] = self.flags.bits();
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
        buf[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        buf
    }

    /// Encodes the segment with a correct pseudo-header checksum (§4.4
    /// "Checksum").
    pub fn encode(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let checksum = self.checksum(src_ip, dst_ip);
        let mut out = Vec::with_capacity(TCP_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.encode_header(checksum));
        out.extend_from_slice(&self.data);
        out
    }

    fn checksum(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> u16 {
        let tcp_len = (TCP_HEADER_LEN + self.data.len()) as u16;
        let mut buf = Vec::with_capacity(12 + tcp_len as usize);
        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.push(0);
        buf.push(TCP_PROTO);
        buf.extend_from_slice(&tcp_len.to_be_bytes());
        buf.extend_from_slice(&self.encode_header(0));
        buf.extend_from_slice(&self.data);
        ones_complement_checksum(&buf)
    }

    pub fn verify_checksum(buf: &[u8], src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        let tcp_len = buf.len() as u16;
        let mut pseudo = Vec::with_capacity(12 + buf.len());
        pseudo.extend_from_slice(&src_ip.octets());
        pseudo.extend_from_slice(&dst_ip.octets());
        pseudo.push(0);
        pseudo.push(TCP_PROTO);
        pseudo.extend_from_slice(&tcp_len.to_be_bytes());
        pseudo.extend_from_slice(buf);
        ones_complement_checksum(&pseudo) == 0
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < TCP_HEADER_LEN {
            return None;
        }
        let data_offset = ((buf[12] >> 4) as usize) * 4;
        if buf.len() < data_offset {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            ack: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            flags: TcpFlags::from_bits_truncate(buf[13]),
            window: u16::from_be_bytes([buf[14], buf[15]]),
            urgent: u16::from_be_bytes([buf[18], buf[19]]),
            data: buf[data_offset..].to_vec(),
        })
    }
}
